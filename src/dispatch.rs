use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::bus::BusClient;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::event::{JobEvent, Outcome, Stage};
use crate::ledger::LedgerStore;
use crate::settlement::{SettleOutcome, SettlementEngine};
use crate::types::{DispatchReceipt, JobStatus, ResultEnvelope, ResultStatus, TaskEnvelope, TransactionKind, TransactionStatus};

/// Entry points `submitAsync` and `submitRPC`. Computes cost, reserves funds,
/// writes a pending job, serializes the task envelope, publishes, and (RPC
/// only) awaits a correlated reply with a dynamic timeout.
#[derive(Clone)]
pub struct DispatchOrchestrator {
    ledger: LedgerStore,
    bus: Arc<BusClient>,
    config: Config,
    settlement: SettlementEngine,
    events: broadcast::Sender<JobEvent>,
}

impl DispatchOrchestrator {
    pub fn new(
        ledger: LedgerStore,
        bus: Arc<BusClient>,
        config: Config,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        let settlement = SettlementEngine::new(ledger.clone());
        Self {
            ledger,
            bus,
            config,
            settlement,
            events,
        }
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    /// Debits, writes the job, appends the payment journal row and commits —
    /// all steps a `submitAsync`/`submitRPC` call shares before it diverges
    /// on how the result comes back.
    async fn reserve_and_record(
        &self,
        user_id: i64,
        rows: &serde_json::Value,
    ) -> AppResult<(i64, Decimal, String)> {
        let model = self.ledger.get_active_model().await?;
        let cost = self.config.default_request_cost;

        let mut unit = self.ledger.begin().await?;

        let applied = unit.conditional_debit(user_id, cost).await?;
        if !applied {
            unit.abort().await?;
            return Err(AppError::InsufficientFunds);
        }

        let job = unit
            .insert_job(user_id, model.id, rows.clone(), cost)
            .await?;

        unit.append_journal(
            user_id,
            -cost,
            TransactionKind::Payment,
            TransactionStatus::Approved,
            format!("job {} (pending)", job.id),
            Some(job.id),
        )
        .await?;

        unit.commit().await?;

        self.emit(JobEvent::new(job.id, user_id, Stage::Dispatched, Outcome::Success));
        info!(job_id = job.id, user_id, %cost, "job dispatched, funds reserved");

        Ok((job.id, cost, model.code_name))
    }

    /// `submitAsync(user, rows)` — at-most-once publish, fire-and-forget.
    pub async fn submit_async(&self, user_id: i64, rows: serde_json::Value) -> AppResult<DispatchReceipt> {
        let (job_id, _cost, model_code_name) = self.reserve_and_record(user_id, &rows).await?;

        let envelope = TaskEnvelope {
            task_id: job_id.to_string(),
            features: rows,
            model: model_code_name,
            user_id,
            timestamp: Utc::now(),
        };

        match self.bus.publish_task(&envelope).await {
            Ok(()) => {
                self.emit(JobEvent::new(job_id, user_id, Stage::Published, Outcome::Success));
            }
            Err(e) => {
                // The unit of work already committed: the job stays `pending`
                // and will be settled whenever (and if) a result eventually
                // arrives via `results.queue`, or an operator intervenes.
                error!(job_id, user_id, error = %e, "publish failed after commit");
                self.emit(
                    JobEvent::new(job_id, user_id, Stage::Published, Outcome::Failure)
                        .with_detail(e.to_string()),
                );
                return Err(AppError::BusUnavailable { job_id: Some(job_id) });
            }
        }

        Ok(DispatchReceipt {
            job_id,
            status: JobStatus::Pending,
        })
    }

    /// `submitRPC(user, rows)` — synchronous, request/reply over the bus.
    pub async fn submit_rpc(&self, user_id: i64, rows: serde_json::Value) -> AppResult<serde_json::Value> {
        let row_count = rows.as_array().map(|a| a.len()).unwrap_or(1) as u64;
        let (job_id, _cost, _model_code_name) = self.reserve_and_record(user_id, &rows).await?;

        let timeout = Duration::from_secs(15).max(Duration::from_millis(10_000 + 200 * row_count));

        let payload = serde_json::to_vec(&rows).map_err(|e| AppError::Validation(e.to_string()))?;
        let reply = self
            .bus
            .rpc_call(&payload, &self.bus.settings().rpc_queue, timeout)
            .await;

        let reply_bytes = match reply {
            Ok(bytes) => bytes,
            Err(e) => {
                // Job stays `pending`: a delayed reply on `results.queue` will
                // still settle it later via the Results Consumer.
                self.emit(
                    JobEvent::new(job_id, user_id, Stage::RpcReply, Outcome::Failure)
                        .with_detail(e.to_string()),
                );
                return Err(e.into());
            }
        };

        self.emit(JobEvent::new(job_id, user_id, Stage::RpcReply, Outcome::Success));

        let prediction: serde_json::Value =
            serde_json::from_slice(&reply_bytes).map_err(|e| AppError::Validation(e.to_string()))?;

        let result = ResultEnvelope {
            task_id: job_id.to_string(),
            prediction: Some(prediction.clone()),
            status: ResultStatus::Success,
            worker_id: None,
            error: None,
        };

        match self.settlement.settle(&result).await? {
            SettleOutcome::Settled { refunded, .. } => {
                if refunded {
                    self.emit(JobEvent::new(job_id, user_id, Stage::Refunded, Outcome::Failure));
                } else {
                    self.emit(JobEvent::new(job_id, user_id, Stage::Settled, Outcome::Success));
                }
            }
            SettleOutcome::AlreadySettled => {
                // The Results Consumer beat us to it — same job, same cost,
                // already terminal. Nothing left to reconcile here.
                self.emit(JobEvent::new(job_id, user_id, Stage::Settled, Outcome::Retry));
            }
        }

        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    // `DispatchOrchestrator` needs a live Postgres + AMQP broker to exercise
    // meaningfully; its behavior is covered by the integration tests in
    // `tests/dispatch_bus.rs`. Pure unit coverage of the timeout formula:
    use std::time::Duration;

    fn rpc_timeout(row_count: u64) -> Duration {
        Duration::from_secs(15).max(Duration::from_millis(10_000 + 200 * row_count))
    }

    #[test]
    fn timeout_floors_at_15s_for_small_batches() {
        assert_eq!(rpc_timeout(1), Duration::from_secs(15));
        assert_eq!(rpc_timeout(10), Duration::from_secs(15));
    }

    #[test]
    fn timeout_scales_with_row_count_past_the_floor() {
        assert_eq!(rpc_timeout(100), Duration::from_millis(30_000));
    }
}
