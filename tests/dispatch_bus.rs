//! Exercises the Dispatch Orchestrator and Bus Client against a real
//! Postgres + AMQP broker. Requires `DATABASE_URL` and `AMQP_URL`; no-ops
//! with a message if either is unset.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;

use credit_dispatch::bus::BusClient;
use credit_dispatch::config::{BusSettings, Config, Mode, RpcSettings};
use credit_dispatch::dispatch::DispatchOrchestrator;
use credit_dispatch::error::AppError;
use credit_dispatch::ledger::LedgerStore;
use credit_dispatch::types::JobStatus;

fn test_config(database_url: String, amqp_url: String) -> Config {
    Config {
        database_url,
        http_port: 0,
        mode: Mode::Dev,
        default_request_cost: dec!(10.00),
        max_replenish_amount: dec!(1000.00),
        bus: BusSettings {
            amqp_url,
            retry_attempts: 3,
            retry_base_ms: 50,
            retry_cap_ms: 200,
            heartbeat_s: 30,
            connect_timeout_s: 5,
            tasks_exchange: format!("test_tasks_exchange_{}", uuid::Uuid::new_v4()),
            tasks_queue: format!("test_task_queue_{}", uuid::Uuid::new_v4()),
            rpc_queue: format!("test_rpc_queue_{}", uuid::Uuid::new_v4()),
            results_exchange: format!("test_results_exchange_{}", uuid::Uuid::new_v4()),
            results_queue: format!("test_results_queue_{}", uuid::Uuid::new_v4()),
        },
        rpc: RpcSettings {
            max_reply_age_s: 300,
            reaper_tick_s: 60,
        },
    }
}

async fn test_env() -> Option<(LedgerStore, Arc<BusClient>, Config)> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let amqp_url = std::env::var("AMQP_URL").ok()?;
    let cfg = test_config(database_url.clone(), amqp_url);
    let ledger = LedgerStore::connect(&database_url).await.expect("connect postgres");
    let bus = BusClient::connect(cfg.bus.clone()).await.expect("connect amqp");
    Some((ledger, bus, cfg))
}

async fn seed_fixture(ledger: &LedgerStore, balance: rust_decimal::Decimal, cost: rust_decimal::Decimal) -> i64 {
    let user_id: i64 = sqlx::query_scalar(
        "INSERT INTO users (display_name, role, balance) VALUES ($1, 'user', $2) RETURNING id",
    )
    .bind(format!("test-user-{}", uuid::Uuid::new_v4()))
    .bind(balance)
    .fetch_one(ledger.pool())
    .await
    .unwrap();

    sqlx::query("UPDATE models SET is_active = false")
        .execute(ledger.pool())
        .await
        .unwrap();

    let _model_id: i64 = sqlx::query_scalar(
        "INSERT INTO models (code_name, version, is_active, cost) VALUES ($1, 'v1', true, $2) RETURNING id",
    )
    .bind(format!("test-model-{}", uuid::Uuid::new_v4()))
    .bind(cost)
    .fetch_one(ledger.pool())
    .await
    .unwrap();

    user_id
}

#[tokio::test]
async fn submit_async_debits_inserts_job_and_publishes() {
    let Some((ledger, bus, cfg)) = test_env().await else {
        eprintln!("skipping: DATABASE_URL/AMQP_URL not set");
        return;
    };
    let cost = cfg.default_request_cost;
    let user_id = seed_fixture(&ledger, dec!(25.00), cost).await;

    let (event_tx, mut event_rx) = tokio::sync::broadcast::channel(16);
    let dispatch = DispatchOrchestrator::new(ledger.clone(), bus.clone(), cfg.clone(), event_tx);

    let receipt = dispatch
        .submit_async(user_id, serde_json::json!([{"a": 1}]))
        .await
        .unwrap();
    assert_eq!(receipt.status, JobStatus::Pending);

    let user = ledger.get_user(user_id).await.unwrap();
    assert_eq!(user.balance, dec!(15.00));

    let job = ledger.get_job(receipt.job_id, Some(user_id)).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.cost, cost);

    // Dispatched + Published lifecycle events were emitted.
    let mut stages = Vec::new();
    while let Ok(event) = tokio::time::timeout(Duration::from_millis(200), event_rx.recv()).await {
        stages.push(event.unwrap().stage);
    }
    assert!(stages.len() >= 2);
}

#[tokio::test]
async fn insufficient_funds_aborts_before_any_publish() {
    let Some((ledger, bus, cfg)) = test_env().await else {
        eprintln!("skipping: DATABASE_URL/AMQP_URL not set");
        return;
    };
    let user_id = seed_fixture(&ledger, dec!(5.00), cfg.default_request_cost).await;

    let (event_tx, _rx) = tokio::sync::broadcast::channel(16);
    let dispatch = DispatchOrchestrator::new(ledger.clone(), bus.clone(), cfg.clone(), event_tx);

    let err = dispatch
        .submit_async(user_id, serde_json::json!([{"a": 1}]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InsufficientFunds));

    let user = ledger.get_user(user_id).await.unwrap();
    assert_eq!(user.balance, dec!(5.00), "no partial debit on insufficient funds");
    assert!(ledger.list_jobs_for_user(user_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn rpc_call_times_out_when_nothing_answers() {
    let Some((_ledger, bus, _cfg)) = test_env().await else {
        eprintln!("skipping: DATABASE_URL/AMQP_URL not set");
        return;
    };

    let result = bus
        .rpc_call(b"{}", "a-routing-key-nobody-consumes", Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(credit_dispatch::error::BusError::Timeout)));
}
