//! Local persistence: the tracking database and the file sinks
//!
//! The tracker owns all message state. The raw store and markdown writer
//! are write collaborators behind the [`RawSink`] and [`MarkdownSink`]
//! traits so the pipeline can run against fakes.

mod raw_store;
mod tracker;
mod writer;

pub use raw_store::{RawEmailStore, RawPaths, RawSink};
pub use tracker::FetchTracker;
pub use writer::{MarkdownSink, MarkdownWriter, slugify};
