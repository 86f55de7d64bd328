//! Error types the pipeline needs to tell apart
//!
//! Everything else travels as `anyhow::Error`; these types are recovered
//! with `downcast_ref` where the orchestrator has to branch on them.

use crate::models::{MessageId, MessageStatus};

/// Gmail kept rejecting requests with HTTP 429 after all retries
#[derive(Debug, thiserror::Error)]
#[error("Rate limited during {context} after {retries} retries")]
pub struct RateLimitError {
    pub context: String,
    pub retries: u32,
}

/// OAuth flow or token refresh failed
#[derive(Debug, thiserror::Error)]
#[error("Authentication failed: {0}")]
pub struct AuthError(pub String);

/// A message payload could not be interpreted
#[derive(Debug, thiserror::Error)]
#[error("Failed to parse message {message_id}: {reason}")]
pub struct ParseError {
    pub message_id: String,
    pub reason: String,
}

/// Neither the HTML nor the plain-text body produced usable content
#[derive(Debug, thiserror::Error)]
#[error("No convertible content for message {0}")]
pub struct ConversionError(pub MessageId);

/// Contract violations against the tracking store. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Message {0} is not tracked")]
    UntrackedMessage(MessageId),

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Returns true if `err` (or anything in its chain) is a rate-limit error
pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<RateLimitError>())
}
