use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A structured lifecycle event for one job, sufficient to reconstruct its
/// history from logs or from the `/events` WebSocket stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: i64,
    pub user_id: i64,
    pub stage: Stage,
    pub outcome: Outcome,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Dispatched,
    Published,
    RpcReply,
    Settled,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Retry,
}

impl JobEvent {
    pub fn new(job_id: i64, user_id: i64, stage: Stage, outcome: Outcome) -> Self {
        Self {
            job_id,
            user_id,
            stage,
            outcome,
            timestamp: Utc::now().to_rfc3339(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
