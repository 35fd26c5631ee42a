use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::info;

use credit_dispatch::admin::AdminSurface;
use credit_dispatch::bus::BusClient;
use credit_dispatch::config;
use credit_dispatch::dispatch::DispatchOrchestrator;
use credit_dispatch::ledger::LedgerStore;
use credit_dispatch::results_consumer::ResultsConsumer;
use credit_dispatch::server;
use credit_dispatch::settlement::SettlementEngine;
use credit_dispatch::types::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credit_dispatch=info".into()),
        )
        .init();

    let cfg = config::Config::from_env();
    info!(?cfg, "loaded configuration");

    let ledger = LedgerStore::connect(&cfg.database_url).await?;
    info!("ledger store ready");

    let bus = BusClient::connect(cfg.bus.clone()).await?;
    info!("bus client ready, topology declared");

    let (event_tx, _) = broadcast::channel(1024);

    let dispatch = DispatchOrchestrator::new(ledger.clone(), bus.clone(), cfg.clone(), event_tx.clone());
    let admin = AdminSurface::new(ledger.clone(), cfg.clone());
    let settlement = SettlementEngine::new(ledger.clone());

    let state = Arc::new(AppState {
        ledger: ledger.clone(),
        dispatch,
        admin,
        event_tx: event_tx.clone(),
        config: cfg.clone(),
    });

    let consumer = ResultsConsumer::new(bus.clone(), settlement, event_tx.clone());
    let consumer_handle = tokio::spawn(consumer.run());

    let server_handle = tokio::spawn(server::run_server(state, cfg.http_port));

    // The HTTP listener, results consumer and (inside `BusClient::connect`)
    // reaper are independent top-level tasks sharing one process lifetime:
    // if either named task here exits, the process exits with it.
    tokio::select! {
        res = consumer_handle => {
            res?;
            info!("results consumer task exited");
        }
        res = server_handle => {
            res??;
            info!("http server task exited");
        }
    }

    Ok(())
}
