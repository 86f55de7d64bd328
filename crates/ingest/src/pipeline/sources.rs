//! Collaborator seams for the pipeline
//!
//! The orchestrator only talks to these traits, so the Gmail client, the
//! converter and test doubles are interchangeable.

use anyhow::Result;

use crate::models::{ConvertedEmail, EmailBody, EmailHeader, Label, MessageId, MessageStub, ParsedMessage};

/// Pages of message references in the source's result order
pub type StubPages<'a> = Box<dyn Iterator<Item = Result<Vec<MessageStub>>> + 'a>;

/// Outcome of fetching a batch: one entry per message the source returned
pub type BatchResult = Vec<(MessageId, Result<ParsedMessage>)>;

/// Lists labels and enumerates message IDs
pub trait DiscoverySource {
    fn list_labels(&self) -> Result<Vec<Label>>;

    /// Lazily page through message references for `label`.
    ///
    /// A page that fails is yielded as `Err` and ends the sequence.
    fn discover_message_ids<'a>(
        &'a self,
        label: &str,
        query: Option<&str>,
        page_size: usize,
    ) -> StubPages<'a>;
}

/// Retrieves full messages
pub trait FetchSource {
    /// Fetch a batch of messages.
    ///
    /// `Err` means the whole batch failed (network, auth, rate limit).
    /// Per-message failures come back inside the result list. IDs the source
    /// did not return at all are simply absent.
    fn fetch_messages_batch(&self, ids: &[MessageId]) -> Result<BatchResult>;
}

/// Renders a fetched message as a markdown document
pub trait ConvertSource {
    fn convert(
        &self,
        message_id: &MessageId,
        header: &EmailHeader,
        body: &EmailBody,
        labels: &[Label],
    ) -> Result<ConvertedEmail>;
}
