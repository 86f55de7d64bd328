//! Pipeline orchestration and its collaborator seams

mod ingestor;
mod sources;

pub use ingestor::{
    Collaborators, DiscoveryStats, Ingestor, NOT_RETURNED, PipelineOptions, ProgressCallback,
};
pub use sources::{BatchResult, ConvertSource, DiscoverySource, FetchSource, StubPages};
