//! Core data types and error definitions for the summarization pipeline.

use crate::config::{BudgetSettings, ConfigError};
use crate::provider::{ProviderError, Usage};
use crate::retry::RetryError;
use serde::Serialize;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Token budgets applied while chunking and merging.
pub type TokenBudget = BudgetSettings;

impl BudgetSettings {
    /// Largest estimate a chunk may carry: `max_chunk_tokens - reserved_tokens`.
    pub fn chunk_limit(&self) -> usize {
        self.max_chunk_tokens.saturating_sub(self.reserved_tokens)
    }

    /// Largest estimate the carried overlap may reach: the overlap budget, capped at half the
    /// chunk limit.
    pub fn overlap_limit(&self) -> usize {
        self.overlap_tokens.min(self.chunk_limit() / 2)
    }
}

/// Errors produced while splitting a document into chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Document contained no paragraphs.
    #[error("document '{0}' contains no text")]
    EmptyDocument(String),
    /// Budget leaves no room for content.
    #[error("chunk budget must be greater than zero (max {max_chunk_tokens}, reserved {reserved_tokens})")]
    InvalidBudget {
        /// Configured maximum per chunk.
        max_chunk_tokens: usize,
        /// Configured reservation.
        reserved_tokens: usize,
    },
    /// Cancellation observed while probing chunk sizes.
    #[error("chunking cancelled")]
    Cancelled,
}

/// Errors emitted by the summarization pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Input document could not be read.
    #[error("Failed to read input '{path}': {source}")]
    Input {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Artifact could not be written or read back.
    #[error("Failed to access artifact '{path}': {source}")]
    Artifact {
        /// Artifact path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Chunking step failed.
    #[error("Failed to chunk document: {0}")]
    Chunking(#[from] ChunkingError),
    /// One chunk could not be summarized; the document fails as a whole.
    #[error("Chunk {index} failed: {source}")]
    ChunkFailed {
        /// 1-based chunk index.
        index: usize,
        /// Final retry outcome.
        #[source]
        source: RetryError<ProviderError>,
    },
    /// Whole-document generation failed on the single-shot path.
    #[error("Single-shot summary failed: {0}")]
    SingleShot(#[source] RetryError<ProviderError>),
    /// The unification pass over chunk summaries failed.
    #[error("Merge of chunk summaries failed: {0}")]
    Merge(#[source] RetryError<ProviderError>),
    /// Another input in the same batch already owns this document's artifact names.
    #[error("Input '{path}' has the same basename as '{existing}'")]
    DuplicateBasename {
        /// Input that was rejected.
        path: PathBuf,
        /// Earlier input that claimed the basename.
        existing: PathBuf,
    },
    /// Configuration was structurally invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Cancellation was observed before the document finished.
    #[error("Pipeline cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether the error represents cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled | Self::Chunking(ChunkingError::Cancelled) => true,
            Self::ChunkFailed { source, .. } => source.is_cancelled(),
            Self::SingleShot(source) | Self::Merge(source) => source.is_cancelled(),
            _ => false,
        }
    }
}

/// An input document, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Identifier used for artifact names; the file stem for loaded files.
    pub id: String,
    /// Where the text came from.
    pub source_path: PathBuf,
    /// Full document text.
    pub raw_text: String,
}

impl Document {
    /// Build a document from text already in memory.
    pub fn new(id: impl Into<String>, source_path: impl Into<PathBuf>, raw_text: String) -> Self {
        Self {
            id: id.into(),
            source_path: source_path.into(),
            raw_text,
        }
    }

    /// Read a document from disk. Missing or empty files are structural errors.
    pub async fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw_text =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| PipelineError::Input {
                    path: path.to_path_buf(),
                    source,
                })?;
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        if raw_text.trim().is_empty() {
            return Err(ChunkingError::EmptyDocument(id).into());
        }
        Ok(Self::new(id, path, raw_text))
    }
}

/// A token-bounded, paragraph-aligned slice of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based position in document order.
    pub index: usize,
    /// Chunk text, paragraphs joined by blank lines.
    pub text: String,
    /// Estimated token count of `text`.
    pub estimated_tokens: usize,
    /// Whether the estimate came from the local heuristic.
    pub approximate: bool,
    /// Paragraph indices covered, including leading overlap.
    pub paragraph_range: Range<usize>,
    /// Leading paragraphs repeated from the previous chunk.
    pub overlap_paragraphs: usize,
}

/// Summary produced for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSummary {
    /// Index of the summarized chunk.
    pub chunk_index: usize,
    /// Generated summary text.
    pub content: String,
    /// Name of the provider that produced it.
    pub provider_used: String,
    /// Token usage reported for the call.
    pub usage: Usage,
}

/// Result of combining chunk summaries.
///
/// `merged_summary` is present only when the unification pass ran; a skipped merge keeps the
/// raw concatenation as the final output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedArtifact {
    raw_concatenated_summaries: String,
    merged_summary: Option<String>,
}

/// Note prepended to the output when the unification pass was skipped.
pub const MERGE_SKIPPED_NOTE: &str = "> Note: the combined chunk summaries exceeded the merge \
budget, so no unification pass was run. The sections below are the individual chunk \
summaries in document order.";

impl CombinedArtifact {
    /// Artifact whose unification pass produced `merged`.
    pub fn merged(raw: String, merged: String) -> Self {
        Self {
            raw_concatenated_summaries: raw,
            merged_summary: Some(merged),
        }
    }

    /// Artifact whose merge was skipped; the concatenation is the final output.
    pub fn skipped(raw: String) -> Self {
        Self {
            raw_concatenated_summaries: raw,
            merged_summary: None,
        }
    }

    /// Concatenated chunk summaries with index markers.
    pub fn raw_concatenated_summaries(&self) -> &str {
        &self.raw_concatenated_summaries
    }

    /// Unified summary, absent when the merge was skipped.
    pub fn merged_summary(&self) -> Option<&str> {
        self.merged_summary.as_deref()
    }

    /// Whether the unification pass was skipped.
    pub fn merge_skipped(&self) -> bool {
        self.merged_summary.is_none()
    }

    /// Text persisted as the document summary.
    pub fn final_text(&self) -> String {
        match &self.merged_summary {
            Some(merged) => merged.clone(),
            None => format!("{MERGE_SKIPPED_NOTE}\n\n{}", self.raw_concatenated_summaries),
        }
    }
}

/// Terminal status of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Output already existed; no provider call was made.
    Skipped,
    /// Summary written.
    Succeeded,
    /// Processing failed; see `error`.
    Failed,
    /// Cancellation was observed before completion.
    Cancelled,
}

/// Outcome reported for each processed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    /// Document identifier.
    pub document_id: String,
    /// Terminal status.
    pub status: PipelineStatus,
    /// Summary path (existing or intended).
    pub output_path: PathBuf,
    /// Error detail for failed or cancelled runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineResult {
    pub(crate) fn new(document_id: &str, status: PipelineStatus, output_path: PathBuf) -> Self {
        Self {
            document_id: document_id.to_string(),
            status,
            output_path,
            error: None,
        }
    }

    pub(crate) fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}
