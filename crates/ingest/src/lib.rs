//! Ingest crate - resumable Gmail to markdown pipeline
//!
//! This crate provides:
//! - Domain models (message identity, tracking rows, progress snapshots)
//! - A durable SQLite tracking store with an enforced status state machine
//! - Gmail API client and OAuth authentication
//! - MIME parsing and HTML to markdown conversion
//! - Raw body and markdown writers
//! - The three-stage orchestrator (discovery, fetch, convert)
//!
//! Every stage reads its work from the tracking store, so a run can be
//! interrupted at any point and picked up again later.

pub mod config;
pub mod convert;
pub mod error;
pub mod gmail;
pub mod models;
pub mod pipeline;
pub mod storage;

pub use config::{GmailCredentials, IngestorSettings};
pub use convert::MarkdownConverter;
pub use error::{
    AuthError, ConversionError, ParseError, RateLimitError, TrackerError, is_rate_limited,
};
pub use gmail::{GmailAuth, GmailClient, RetryPolicy};
pub use models::{
    ConvertedEmail, EmailBody, EmailHeader, FailedMessage, FetchRun, Label, LabelId, MessageId,
    MessageStatus, MessageStub, ParsedMessage, Progress, RunCounts, RunId, RunStatus, Stage,
    StatusCounts, StatusUpdate, ThreadId, TrackedMessage,
};
pub use pipeline::{
    BatchResult, Collaborators, ConvertSource, DiscoveryStats, DiscoverySource, FetchSource,
    Ingestor, PipelineOptions, StubPages,
};
pub use storage::{FetchTracker, MarkdownSink, MarkdownWriter, RawEmailStore, RawPaths, RawSink};
