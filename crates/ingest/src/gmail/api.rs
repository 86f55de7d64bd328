//! Wire shapes of the Gmail REST responses this crate reads
//!
//! Fields Gmail sends that nothing here uses are left out; serde skips them.

use serde::Deserialize;

/// One page of `users.messages.list`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMessagesResponse {
    pub messages: Option<Vec<MessageRef>>,
    pub next_page_token: Option<String>,
    pub result_size_estimate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    pub thread_id: String,
}

/// `users.labels.list`
#[derive(Debug, Default, Deserialize)]
pub struct ListLabelsResponse {
    pub labels: Option<Vec<LabelRef>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelRef {
    pub id: String,
    pub name: String,
}

/// `users.messages.get` with `format=full`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    pub label_ids: Option<Vec<String>>,
    /// Milliseconds since the epoch, as a decimal string
    pub internal_date: Option<String>,
    pub payload: Option<MessagePart>,
}

/// Node of the MIME tree; `payload` is the root
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub mime_type: Option<String>,
    /// Non-empty for attachments
    pub filename: Option<String>,
    pub headers: Option<Vec<Header>>,
    pub body: Option<MessageBody>,
    pub parts: Option<Vec<MessagePart>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageBody {
    /// base64url, padding optional
    pub data: Option<String>,
}
