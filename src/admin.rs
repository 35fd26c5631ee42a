use rust_decimal::Decimal;
use tracing::info;

use crate::config::{Config, Mode};
use crate::error::{AppError, AppResult};
use crate::ledger::LedgerStore;
use crate::types::{InferenceJob, Transaction, TransactionKind, TransactionStatus, User};

/// Thin operations over the Ledger Store: approve/reject pending
/// replenishments, direct credit, and the read-only aggregates the HTTP
/// surface exposes to admins. Every write is a single unit of work.
#[derive(Clone)]
pub struct AdminSurface {
    ledger: LedgerStore,
    config: Config,
}

impl AdminSurface {
    pub fn new(ledger: LedgerStore, config: Config) -> Self {
        Self { ledger, config }
    }

    /// `directCredit(user_id, amount)`: unconditional credit + an approved
    /// replenish journal row.
    pub async fn direct_credit(&self, user_id: i64, amount: Decimal) -> AppResult<Transaction> {
        let mut unit = self.ledger.begin().await?;
        unit.unconditional_credit(user_id, amount).await?;
        let row = unit
            .append_journal(
                user_id,
                amount,
                TransactionKind::Replenish,
                TransactionStatus::Approved,
                "direct credit",
                None,
            )
            .await?;
        unit.commit().await?;
        info!(user_id, %amount, "direct credit applied");
        Ok(row)
    }

    /// `approvePending(tx_id)`: only if `status = pending` — unconditional
    /// credit of the row's amount, then mark it approved.
    pub async fn approve_pending(&self, tx_id: i64) -> AppResult<Transaction> {
        let mut unit = self.ledger.begin().await?;
        let row = unit.get_transaction_for_update(tx_id).await?;
        if row.status != TransactionStatus::Pending {
            unit.abort().await?;
            return Err(AppError::Validation(format!("transaction {tx_id} is not pending")));
        }
        unit.unconditional_credit(row.user_id, row.amount).await?;
        unit.set_transaction_status(tx_id, TransactionStatus::Approved).await?;
        unit.commit().await?;
        info!(tx_id, user_id = row.user_id, amount = %row.amount, "replenishment approved");
        self.ledger.get_transaction(tx_id).await.map_err(Into::into)
    }

    /// `rejectPending(tx_id)`: only if `status = pending` — set `rejected`,
    /// no balance change.
    pub async fn reject_pending(&self, tx_id: i64) -> AppResult<Transaction> {
        let mut unit = self.ledger.begin().await?;
        let row = unit.get_transaction_for_update(tx_id).await?;
        if row.status != TransactionStatus::Pending {
            unit.abort().await?;
            return Err(AppError::Validation(format!("transaction {tx_id} is not pending")));
        }
        unit.set_transaction_status(tx_id, TransactionStatus::Rejected).await?;
        unit.commit().await?;
        info!(tx_id, user_id = row.user_id, "replenishment rejected");
        self.ledger.get_transaction(tx_id).await.map_err(Into::into)
    }

    /// `replenishmentRequest(user, amount)`: in `DEV` mode auto-approves
    /// (credits immediately), otherwise leaves a `pending` row for an admin.
    pub async fn replenishment_request(&self, user_id: i64, amount: Decimal) -> AppResult<Transaction> {
        if amount <= Decimal::ZERO || amount > self.config.max_replenish_amount {
            return Err(AppError::Validation(format!(
                "replenish amount must be in (0, {}]",
                self.config.max_replenish_amount
            )));
        }

        let auto_approve = self.config.mode == Mode::Dev;
        let mut unit = self.ledger.begin().await?;
        let status = if auto_approve {
            TransactionStatus::Approved
        } else {
            TransactionStatus::Pending
        };
        if auto_approve {
            unit.unconditional_credit(user_id, amount).await?;
        }
        let row = unit
            .append_journal(
                user_id,
                amount,
                TransactionKind::Replenish,
                status,
                "user replenishment request",
                None,
            )
            .await?;
        unit.commit().await?;
        info!(user_id, %amount, auto_approve, "replenishment requested");
        Ok(row)
    }

    pub async fn get_user(&self, user_id: i64) -> AppResult<User> {
        self.ledger.get_user(user_id).await.map_err(Into::into)
    }

    pub async fn list_users(&self) -> AppResult<Vec<User>> {
        self.ledger.list_users().await.map_err(Into::into)
    }

    pub async fn list_all_transactions(&self) -> AppResult<Vec<Transaction>> {
        self.ledger.list_all_transactions().await.map_err(Into::into)
    }

    pub async fn list_all_jobs(&self) -> AppResult<Vec<InferenceJob>> {
        self.ledger.list_all_jobs().await.map_err(Into::into)
    }

    pub async fn list_journal_for_user(&self, user_id: i64) -> AppResult<Vec<Transaction>> {
        self.ledger.list_journal_for_user(user_id).await.map_err(Into::into)
    }

    pub async fn list_jobs_for_user(&self, user_id: i64) -> AppResult<Vec<InferenceJob>> {
        self.ledger.list_jobs_for_user(user_id).await.map_err(Into::into)
    }

    pub async fn get_job(&self, job_id: i64, owner: Option<i64>) -> AppResult<InferenceJob> {
        self.ledger.get_job(job_id, owner).await.map_err(Into::into)
    }

    /// `pending` jobs older than `older_than_minutes` — the operator-facing
    /// view over jobs a post-commit publish failure may have stranded.
    pub async fn list_stale_pending_jobs(&self, older_than_minutes: i64) -> AppResult<Vec<InferenceJob>> {
        self.ledger.list_stale_pending_jobs(older_than_minutes).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    // Exercised against a live Postgres instance in `tests/admin.rs`; see
    // there for the approve/reject/direct-credit scenarios.
}
