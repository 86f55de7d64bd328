//! Domain models for the ingestion pipeline

mod label;
mod message;
mod progress;
mod run;
mod status;
mod tracked;

pub use label::{Label, LabelId};
pub use message::{
    ConvertedEmail, EmailBody, EmailHeader, MessageId, MessageStub, ParsedMessage, ThreadId, epoch,
};
pub use progress::{FailedMessage, Progress, Stage};
pub use run::{FetchRun, RunCounts, RunId, RunStatus};
pub use status::{InvalidStatusError, MessageStatus, StatusCounts};
pub use tracked::{StatusUpdate, TrackedMessage};
