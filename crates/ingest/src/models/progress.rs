//! Progress snapshots delivered to observers during a run

use serde::Serialize;

use super::{MessageId, StatusCounts};

/// Pipeline stage currently executing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Idle,
    Labels,
    Discovery,
    Fetch,
    Convert,
    Complete,
    Error(String),
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Idle => f.write_str("idle"),
            Stage::Labels => f.write_str("labels"),
            Stage::Discovery => f.write_str("discovery"),
            Stage::Fetch => f.write_str("fetch"),
            Stage::Convert => f.write_str("convert"),
            Stage::Complete => f.write_str("complete"),
            Stage::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// A message that failed during the current run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedMessage {
    pub message_id: MessageId,
    pub error: String,
}

/// Snapshot of pipeline progress
///
/// Counters are cumulative for the lifetime of the orchestrator instance
/// (or since the start of the last composite run).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub current_stage: Stage,
    /// Identifiers yielded by discovery after offset/limit
    pub ids_discovered: usize,
    /// Of those, how many were not already tracked
    pub ids_new: usize,
    pub messages_fetched: usize,
    pub messages_converted: usize,
    pub messages_failed: usize,
    /// Tracking store totals at the time of the snapshot
    pub status_counts: StatusCounts,
    /// Identifiers that failed in the most recent page or batch
    pub last_batch_failed: Vec<MessageId>,
    /// Every failure recorded so far, in order
    pub failures: Vec<FailedMessage>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            current_stage: Stage::Idle,
            ids_discovered: 0,
            ids_new: 0,
            messages_fetched: 0,
            messages_converted: 0,
            messages_failed: 0,
            status_counts: StatusCounts::default(),
            last_batch_failed: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl Progress {
    pub fn new(stage: Stage) -> Self {
        Self {
            current_stage: stage,
            ..Self::default()
        }
    }

    pub(crate) fn record_failure(&mut self, message_id: &MessageId, error: impl Into<String>) {
        self.messages_failed += 1;
        self.last_batch_failed.push(message_id.clone());
        self.failures.push(FailedMessage {
            message_id: message_id.clone(),
            error: error.into(),
        });
    }

    /// One-line summary suitable for a terminal status line
    pub fn summary(&self) -> String {
        format!(
            "[{}] discovered={} new={} fetched={} converted={} failed={}",
            self.current_stage,
            self.ids_discovered,
            self.ids_new,
            self.messages_fetched,
            self.messages_converted,
            self.messages_failed
        )
    }
}
