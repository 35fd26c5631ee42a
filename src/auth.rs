use axum::http::HeaderMap;

use crate::error::{AppError, AppResult};
use crate::ledger::LedgerStore;
use crate::types::UserRole;

/// Header-based stand-in for the (out of scope) auth subsystem: callers are
/// identified by `X-User-Id`. The real account system issues and verifies
/// whatever credential backs this value; that verification happens upstream
/// of this service.
pub const USER_ID_HEADER: &str = "x-user-id";

pub fn caller_id(headers: &HeaderMap) -> AppResult<i64> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| AppError::Validation(format!("missing or invalid {USER_ID_HEADER} header")))
}

/// Same as `caller_id`, but additionally requires `role = admin` on the
/// resolved user.
pub async fn require_admin(ledger: &LedgerStore, headers: &HeaderMap) -> AppResult<i64> {
    let user_id = caller_id(headers)?;
    let user = ledger.get_user(user_id).await?;
    if user.role != UserRole::Admin {
        return Err(AppError::Validation("admin role required".into()));
    }
    Ok(user_id)
}
