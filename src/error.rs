use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Errors raised by the Ledger Store.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Errors raised by the Bus Client.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable for task {task_id}: {source}")]
    Unavailable {
        task_id: String,
        source: anyhow::Error,
    },
    #[error("rpc reply timed out")]
    Timeout,
}

/// Errors raised by the Settlement Engine.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("job already settled")]
    AlreadySettled,
}

/// Top-level error returned by the Dispatch Orchestrator, Admin Surface and HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("bus unavailable{}", job_id.map(|j| format!(" for job {j}")).unwrap_or_default())]
    BusUnavailable { job_id: Option<i64> },
    #[error("rpc reply timed out")]
    Timeout,
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl From<LedgerError> for AppError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(s) => AppError::NotFound(s),
            LedgerError::Conflict(s) => AppError::Validation(s),
            LedgerError::Storage(e) => AppError::Storage(e),
        }
    }
}

impl From<SettlementError> for AppError {
    fn from(e: SettlementError) -> Self {
        match e {
            SettlementError::Ledger(l) => l.into(),
            SettlementError::AlreadySettled => {
                AppError::Validation("job already settled".into())
            }
        }
    }
}

impl From<BusError> for AppError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Unavailable { task_id, .. } => AppError::BusUnavailable {
                job_id: task_id.parse().ok(),
            },
            BusError::Timeout => AppError::Timeout,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::BusUnavailable { .. } | AppError::Storage(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        };
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: &AppError) -> StatusCode {
        match err {
            AppError::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::BusUnavailable { .. } | AppError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    #[test]
    fn insufficient_funds_maps_to_402() {
        assert_eq!(status_of(&AppError::InsufficientFunds), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn bus_unavailable_maps_to_503_with_or_without_job_id() {
        assert_eq!(status_of(&AppError::BusUnavailable { job_id: Some(7) }), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_of(&AppError::BusUnavailable { job_id: None }), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn already_settled_never_reaches_http() {
        // AlreadySettled has no AppError variant at all: SettlementError::AlreadySettled
        // maps to AppError::Validation at the From impl below, but the Results Consumer
        // swallows it before it ever gets there (see results_consumer::handle_delivery).
        let err: AppError = SettlementError::AlreadySettled.into();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn bus_timeout_maps_to_504() {
        let err: AppError = BusError::Timeout.into();
        assert!(matches!(err, AppError::Timeout));
        assert_eq!(status_of(&err), StatusCode::GATEWAY_TIMEOUT);
    }
}
