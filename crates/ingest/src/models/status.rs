//! Message lifecycle status and its transition rules

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Processing status of a tracked message
///
/// ```text
///            fetch ok           convert ok
/// pending ───────────▶ fetched ───────────▶ converted
///    │  ▲                 │
///    │  └──── retry ───┐  │ convert err
///    │ fetch err       │  ▼
///    └─────────────▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Fetched,
    Converted,
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 4] = [
        MessageStatus::Pending,
        MessageStatus::Fetched,
        MessageStatus::Converted,
        MessageStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Fetched => "fetched",
            MessageStatus::Converted => "converted",
            MessageStatus::Failed => "failed",
        }
    }

    /// Whether a single-row update may move a message from `self` to `next`.
    ///
    /// `failed -> pending` is deliberately absent: it is only reachable
    /// through the bulk retry operation.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Fetched) | (Pending, Failed) | (Fetched, Converted) | (Fetched, Failed)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string
#[derive(Debug, thiserror::Error)]
#[error("Invalid status: {0}")]
pub struct InvalidStatusError(pub String);

impl FromStr for MessageStatus {
    type Err = InvalidStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "fetched" => Ok(MessageStatus::Fetched),
            "converted" => Ok(MessageStatus::Converted),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(InvalidStatusError(other.to_string())),
        }
    }
}

/// Number of tracked messages in each status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub fetched: usize,
    pub converted: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn get(&self, status: MessageStatus) -> usize {
        match status {
            MessageStatus::Pending => self.pending,
            MessageStatus::Fetched => self.fetched,
            MessageStatus::Converted => self.converted,
            MessageStatus::Failed => self.failed,
        }
    }

    pub fn set(&mut self, status: MessageStatus, count: usize) {
        match status {
            MessageStatus::Pending => self.pending = count,
            MessageStatus::Fetched => self.fetched = count,
            MessageStatus::Converted => self.converted = count,
            MessageStatus::Failed => self.failed = count,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.fetched + self.converted + self.failed
    }

    /// Iterate `(status, count)` pairs in lifecycle order
    pub fn iter(&self) -> impl Iterator<Item = (MessageStatus, usize)> + '_ {
        MessageStatus::ALL.iter().map(|s| (*s, self.get(*s)))
    }
}
