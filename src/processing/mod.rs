//! Document summarization pipeline: chunking, per-chunk generation, merge and persistence.

pub mod artifacts;
pub mod chunking;
pub mod integrate;
pub mod merge;
pub mod progress;
pub mod prompt;
mod service;
pub mod summarize;
pub mod types;

pub use artifacts::ArtifactPaths;
pub use chunking::DocumentChunker;
pub use integrate::{INTEGRATED_REPORT_FILE, IntegratedReport, IntegrationError, IntegrationStatus};
pub use merge::{HierarchicalMerger, MergeOutcome};
pub use progress::{ChannelProgress, NoopProgress, PipelineEvent, ProgressSink};
pub use prompt::PromptContext;
pub use service::{Pipeline, PipelineContext, collect_inputs};
pub use summarize::{ChunkSummarizer, Generated};
pub use types::{
    Chunk, ChunkSummary, ChunkingError, CombinedArtifact, Document, MERGE_SKIPPED_NOTE,
    PipelineError, PipelineResult, PipelineStatus, TokenBudget,
};
