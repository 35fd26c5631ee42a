use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::auth::{caller_id, require_admin};
use crate::error::AppResult;
use crate::types::{AppState, DispatchReceipt, InferenceJob, Transaction, User};

/// Thin axum router over the Dispatch Orchestrator, Admin Surface and read
/// views, plus a WebSocket stream of job lifecycle events. Routing, parsing
/// and CORS are not load-bearing; identity is a header-based stand-in for
/// the (out of scope) auth subsystem.
pub async fn run_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/jobs/async", post(submit_async))
        .route("/jobs/rpc", post(submit_rpc))
        .route("/jobs/:id", get(get_job))
        .route("/jobs", get(list_jobs))
        .route("/ledger", get(list_ledger))
        .route("/wallet/replenish", post(replenish))
        .route("/admin/credit", post(admin_credit))
        .route("/admin/transactions/:id/approve", post(admin_approve))
        .route("/admin/transactions/:id/reject", post(admin_reject))
        .route("/admin/users", get(admin_list_users))
        .route("/admin/transactions", get(admin_list_transactions))
        .route("/admin/jobs", get(admin_list_jobs))
        .route("/admin/jobs/stale", get(admin_list_stale_jobs))
        .route("/events", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "HTTP + WebSocket server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    rows: serde_json::Value,
}

async fn submit_async(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> AppResult<Json<DispatchReceipt>> {
    let user_id = caller_id(&headers)?;
    let receipt = state.dispatch.submit_async(user_id, req.rows).await?;
    Ok(Json(receipt))
}

async fn submit_rpc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let user_id = caller_id(&headers)?;
    let prediction = state.dispatch.submit_rpc(user_id, req.rows).await?;
    Ok(Json(prediction))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> AppResult<Json<InferenceJob>> {
    let user_id = caller_id(&headers)?;
    let job = state.ledger.get_job(id, Some(user_id)).await?;
    Ok(Json(job))
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<InferenceJob>>> {
    let user_id = caller_id(&headers)?;
    Ok(Json(state.ledger.list_jobs_for_user(user_id).await?))
}

async fn list_ledger(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<Transaction>>> {
    let user_id = caller_id(&headers)?;
    Ok(Json(state.ledger.list_journal_for_user(user_id).await?))
}

#[derive(Debug, Deserialize)]
struct ReplenishRequest {
    amount: Decimal,
}

async fn replenish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReplenishRequest>,
) -> AppResult<Json<Transaction>> {
    let user_id = caller_id(&headers)?;
    Ok(Json(state.admin.replenishment_request(user_id, req.amount).await?))
}

#[derive(Debug, Deserialize)]
struct CreditRequest {
    user_id: i64,
    amount: Decimal,
}

async fn admin_credit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreditRequest>,
) -> AppResult<Json<Transaction>> {
    require_admin(&state.ledger, &headers).await?;
    Ok(Json(state.admin.direct_credit(req.user_id, req.amount).await?))
}

async fn admin_approve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> AppResult<Json<Transaction>> {
    require_admin(&state.ledger, &headers).await?;
    Ok(Json(state.admin.approve_pending(id).await?))
}

async fn admin_reject(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> AppResult<Json<Transaction>> {
    require_admin(&state.ledger, &headers).await?;
    Ok(Json(state.admin.reject_pending(id).await?))
}

async fn admin_list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<User>>> {
    require_admin(&state.ledger, &headers).await?;
    Ok(Json(state.admin.list_users().await?))
}

async fn admin_list_transactions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<Transaction>>> {
    require_admin(&state.ledger, &headers).await?;
    Ok(Json(state.admin.list_all_transactions().await?))
}

async fn admin_list_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<InferenceJob>>> {
    require_admin(&state.ledger, &headers).await?;
    Ok(Json(state.admin.list_all_jobs().await?))
}

#[derive(Debug, Deserialize)]
struct StaleJobsQuery {
    #[serde(default = "default_stale_minutes")]
    minutes: i64,
}

fn default_stale_minutes() -> i64 {
    15
}

async fn admin_list_stale_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StaleJobsQuery>,
) -> AppResult<Json<Vec<InferenceJob>>> {
    require_admin(&state.ledger, &headers).await?;
    Ok(Json(state.admin.list_stale_pending_jobs(query.minutes).await?))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.event_tx.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged, dropping stale events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                let Ok(body) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(body)).await.is_err() {
                    return;
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {}
                }
            }
        }
    }
}

