use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amqprs::channel::{BasicConsumeArguments, Channel, ConsumerMessage, QueueDeclareArguments};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::bus::BusClient;
use crate::event::{JobEvent, Outcome, Stage};
use crate::settlement::{SettleOutcome, SettlementEngine};
use crate::types::ResultEnvelope;

/// A single long-lived subscriber of `results.queue`. Survives broker
/// reconnects by retrying connection with a fixed base delay; hands every
/// delivery to the Settlement Engine and acks or nacks based on the outcome.
pub struct ResultsConsumer {
    bus: Arc<BusClient>,
    settlement: SettlementEngine,
    events: broadcast::Sender<JobEvent>,
    stop: Arc<AtomicBool>,
}

impl ResultsConsumer {
    pub fn new(bus: Arc<BusClient>, settlement: SettlementEngine, events: broadcast::Sender<JobEvent>) -> Self {
        Self {
            bus,
            settlement,
            events,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that stops the consumer loop the next time it checks, within
    /// one message's processing time.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run(self) {
        let reconnect_delay = Duration::from_secs(5);
        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("results consumer stopping");
                return;
            }
            match self.run_once().await {
                Ok(()) => return, // stop signal observed mid-consume
                Err(e) => {
                    warn!(error = %e, "results consumer disconnected, retrying");
                    tokio::time::sleep(reconnect_delay).await;
                }
            }
        }
    }

    async fn run_once(&self) -> Result<(), anyhow::Error> {
        self.bus.ensure_topology().await?;
        let channel: Channel = self.bus.consumer_channel().await?;

        let queue = self.bus.settings().results_queue.clone();
        channel
            .queue_declare(QueueDeclareArguments::new(&queue).durable(true).finish())
            .await?;

        let (_ctag, mut message_rx) = channel
            .basic_consume_rx(BasicConsumeArguments::new(&queue, "results-consumer").finish())
            .await?;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                channel.close().await.ok();
                return Ok(());
            }

            let delivery = tokio::time::timeout(Duration::from_millis(500), message_rx.recv()).await;
            let ConsumerMessage { deliver, content, .. } = match delivery {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(anyhow::anyhow!("results consumer channel closed")),
                Err(_) => continue, // poll timeout, loop back to check the stop flag
            };

            let Some(deliver) = deliver else { continue };
            let delivery_tag = deliver.delivery_tag();

            let Some(body) = content else {
                warn!(delivery_tag, "empty delivery, ack and drop");
                self.bus.ack(&channel, delivery_tag).await.ok();
                continue;
            };

            self.handle_delivery(&channel, delivery_tag, &body).await;
        }
    }

    async fn handle_delivery(&self, channel: &Channel, delivery_tag: u64, body: &[u8]) {
        let result: ResultEnvelope = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => {
                warn!(delivery_tag, error = %e, "malformed result envelope, ack and drop");
                self.bus.ack(channel, delivery_tag).await.ok();
                return;
            }
        };

        if result.task_id.parse::<i64>().is_err() {
            warn!(delivery_tag, task_id = %result.task_id, "task_id is not an integer job id, ack and drop");
            self.bus.ack(channel, delivery_tag).await.ok();
            return;
        }

        match self.settlement.settle(&result).await {
            Ok(SettleOutcome::Settled { user_id, refunded }) => {
                self.bus.ack(channel, delivery_tag).await.ok();
                if let Ok(job_id) = result.task_id.parse::<i64>() {
                    if refunded {
                        self.emit(job_id, user_id, Stage::Refunded, Outcome::Failure);
                    } else {
                        self.emit(job_id, user_id, Stage::Settled, Outcome::Success);
                    }
                }
            }
            Ok(SettleOutcome::AlreadySettled) => {
                // Idempotence guard tripped: ack and drop, not a failure.
                self.bus.ack(channel, delivery_tag).await.ok();
            }
            Err(e) => {
                error!(delivery_tag, error = %e, "settlement failed, requeueing");
                self.bus.nack_requeue(channel, delivery_tag).await.ok();
            }
        }
    }

    fn emit(&self, job_id: i64, user_id: i64, stage: Stage, outcome: Outcome) {
        let _ = self.events.send(JobEvent::new(job_id, user_id, stage, outcome));
    }
}
