//! Message identity and parsed content

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a message (Gmail message ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gmail thread ID (informational only)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lightweight message reference yielded by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStub {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
}

impl MessageStub {
    pub fn new(message_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::new(message_id),
            thread_id: ThreadId::new(thread_id),
        }
    }
}

/// The Unix epoch, used when a message date is missing or unparseable
pub fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Headers extracted from a message
#[derive(Debug, Clone, PartialEq)]
pub struct EmailHeader {
    pub subject: String,
    pub sender: String,
    pub to: String,
    pub date: DateTime<Utc>,
    pub cc: String,
    pub message_id_header: String,
}

impl EmailHeader {
    pub fn new(
        subject: impl Into<String>,
        sender: impl Into<String>,
        to: impl Into<String>,
        date: DateTime<Utc>,
    ) -> Self {
        Self {
            subject: subject.into(),
            sender: sender.into(),
            to: to.into(),
            date,
            cc: String::new(),
            message_id_header: String::new(),
        }
    }
}

impl Default for EmailHeader {
    fn default() -> Self {
        Self::new("(no subject)", "", "", epoch())
    }
}

/// Body content of a message; either flavour may be absent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailBody {
    pub plain_text: Option<String>,
    pub html: Option<String>,
}

impl EmailBody {
    pub fn new(plain_text: Option<String>, html: Option<String>) -> Self {
        Self { plain_text, html }
    }

    pub fn is_empty(&self) -> bool {
        self.plain_text.is_none() && self.html.is_none()
    }
}

/// A fully parsed message as returned by the fetch stage
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub label_ids: Vec<String>,
    pub header: EmailHeader,
    pub body: EmailBody,
}

/// A message rendered to markdown, ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedEmail {
    pub message_id: MessageId,
    pub markdown: String,
    pub header: EmailHeader,
}
