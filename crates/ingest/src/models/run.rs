//! Audit records for pipeline runs

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Handle returned by `start_run`, used to close the record later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunId(pub i64);

/// Terminal state of a run. Runs that crashed have no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(RunStatus::Completed),
            "aborted" => Some(RunStatus::Aborted),
            _ => None,
        }
    }
}

/// Counters recorded when a run closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub ids_discovered: usize,
    pub messages_fetched: usize,
    pub messages_converted: usize,
    pub messages_failed: usize,
}

/// A row from the run audit table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchRun {
    pub id: RunId,
    pub label_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    /// `None` while running or if the process died mid-run
    pub status: Option<RunStatus>,
}
