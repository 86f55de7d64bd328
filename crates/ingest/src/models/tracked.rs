//! Persisted per-message tracking row

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{MessageId, MessageStatus, ThreadId};

/// One row of the tracking store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedMessage {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    /// Label being ingested when this message was discovered
    pub label_id: String,
    pub status: MessageStatus,
    pub subject: String,
    pub sender: String,
    pub recipients: String,
    /// Message date as RFC 3339, empty until fetched
    pub date: String,
    pub raw_text_path: Option<String>,
    pub raw_html_path: Option<String>,
    pub markdown_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cc: String,
    /// The RFC 5322 `Message-ID` header, not the Gmail ID
    pub message_id_header: String,
}

impl TrackedMessage {
    /// True once any raw body has been written for this message
    pub fn has_raw_content(&self) -> bool {
        self.raw_text_path.is_some() || self.raw_html_path.is_some()
    }
}

/// Optional fields written alongside a status transition
///
/// Only fields that are `Some` are written; everything else on the row is
/// left untouched.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub error_message: Option<String>,
    pub raw_text_path: Option<String>,
    pub raw_html_path: Option<String>,
    pub markdown_path: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub recipients: Option<String>,
    pub date: Option<String>,
    pub cc: Option<String>,
    pub message_id_header: Option<String>,
}

impl StatusUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn markdown(path: impl Into<String>) -> Self {
        Self {
            markdown_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_raw_paths(mut self, text: Option<String>, html: Option<String>) -> Self {
        self.raw_text_path = text;
        self.raw_html_path = html;
        self
    }

    pub fn with_header(mut self, header: &super::EmailHeader) -> Self {
        self.subject = Some(header.subject.clone());
        self.sender = Some(header.sender.clone());
        self.recipients = Some(header.to.clone());
        self.date = Some(header.date.to_rfc3339());
        self.cc = Some(header.cc.clone());
        self.message_id_header = Some(header.message_id_header.clone());
        self
    }
}
