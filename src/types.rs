use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::admin::AdminSurface;
use crate::config::Config;
use crate::dispatch::DispatchOrchestrator;
use crate::event::JobEvent;
use crate::ledger::LedgerStore;

/// Shared application state across the HTTP surface and background tasks.
pub struct AppState {
    pub ledger: LedgerStore,
    pub dispatch: DispatchOrchestrator,
    pub admin: AdminSurface,
    pub event_tx: broadcast::Sender<JobEvent>,
    pub config: Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub display_name: String,
    pub role: UserRole,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum TransactionKind {
    Replenish,
    Payment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub description: String,
    pub job_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Success,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InferenceJob {
    pub id: i64,
    pub user_id: i64,
    pub model_id: i64,
    pub input_data: serde_json::Value,
    pub prediction: Option<serde_json::Value>,
    pub errors: Option<serde_json::Value>,
    pub status: JobStatus,
    pub cost: Decimal,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Model {
    pub id: i64,
    pub code_name: String,
    pub version: String,
    pub is_active: bool,
    pub cost: Decimal,
}

/// Task envelope published to `tasks.exchange` / consumed from `rpc.queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub features: serde_json::Value,
    pub model: String,
    pub user_id: i64,
    pub timestamp: DateTime<Utc>,
}

/// Result envelope consumed from `results.queue` (and returned by a synchronous RPC reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<serde_json::Value>,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Fail,
}

/// Outcome returned by `submitAsync`.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    pub job_id: i64,
    pub status: JobStatus,
}
