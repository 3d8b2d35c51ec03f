//! Hierarchical merge of chunk summaries into one document summary.

use super::artifacts::{artifact_error, write_atomic};
use super::prompt::{self, PromptContext};
use super::service::PipelineContext;
use super::types::{ChunkSummary, CombinedArtifact, PipelineError};
use std::path::Path;
use tokio_util::sync::CancellationToken;

const CHUNK_MARKER: &str = "## Chunk ";

/// Merge result plus any reasoning trace returned by the unification call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Combined artifact; `merged_summary` is absent when the merge was skipped.
    pub artifact: CombinedArtifact,
    /// Reasoning trace of the unification call.
    pub thinking: Option<String>,
}

/// Combines chunk summaries under the merge token budget.
pub struct HierarchicalMerger<'a> {
    context: &'a PipelineContext,
    prompt: &'a PromptContext,
    document_id: &'a str,
}

impl<'a> HierarchicalMerger<'a> {
    /// Merger for one document.
    pub fn new(
        context: &'a PipelineContext,
        prompt: &'a PromptContext,
        document_id: &'a str,
    ) -> Self {
        Self {
            context,
            prompt,
            document_id,
        }
    }

    /// Merge `summaries` in chunk order.
    ///
    /// A single summary is returned as-is with no provider call. Otherwise the concatenation is
    /// written to `combined_path` before the merge is attempted.
    pub async fn merge(
        &self,
        mut summaries: Vec<ChunkSummary>,
        combined_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<MergeOutcome, PipelineError> {
        summaries.sort_by_key(|summary| summary.chunk_index);
        if let [only] = summaries.as_slice() {
            tracing::debug!(document = self.document_id, "Single chunk; merge not needed");
            return Ok(MergeOutcome {
                artifact: CombinedArtifact::merged(only.content.clone(), only.content.clone()),
                thinking: None,
            });
        }

        let raw = concatenate(&summaries);
        write_atomic(combined_path, &raw)
            .await
            .map_err(artifact_error(combined_path))?;
        tracing::info!(
            document = self.document_id,
            path = %combined_path.display(),
            parts = summaries.len(),
            "Persisted combined chunk summaries"
        );
        self.merge_concatenated(raw, summaries.len(), cancel).await
    }

    /// Run the budget check and unification pass over an existing concatenation.
    pub async fn merge_concatenated(
        &self,
        raw: String,
        parts: usize,
        cancel: &CancellationToken,
    ) -> Result<MergeOutcome, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let threshold = self.context.budget.merge_threshold_tokens;
        let estimate = self
            .context
            .estimator
            .estimate(self.context.registry.primary().as_ref(), &raw)
            .await;

        if estimate.tokens > threshold {
            tracing::warn!(
                document = self.document_id,
                estimated_tokens = estimate.tokens,
                threshold,
                "Combined summaries exceed merge budget; skipping unification pass"
            );
            self.context.metrics.record_merge(true);
            return Ok(MergeOutcome {
                artifact: CombinedArtifact::skipped(raw),
                thinking: None,
            });
        }

        let request = self.context.request(prompt::merge_prompt(
            self.prompt,
            self.document_id,
            parts,
            &raw,
        ));
        let label = format!("{} merge", self.document_id);
        let generated = self
            .context
            .generate(&label, estimate.tokens, &request, cancel)
            .await
            .map_err(PipelineError::Merge)?;
        self.context.metrics.record_merge(false);
        tracing::info!(
            document = self.document_id,
            parts,
            provider = %generated.provider,
            "Merged chunk summaries"
        );
        Ok(MergeOutcome {
            artifact: CombinedArtifact::merged(raw, generated.content),
            thinking: generated.thinking,
        })
    }
}

/// Join summaries with `## Chunk i of N` markers, in the order given.
pub(crate) fn concatenate(summaries: &[ChunkSummary]) -> String {
    let total = summaries.len();
    summaries
        .iter()
        .map(|summary| {
            format!(
                "{CHUNK_MARKER}{} of {total}\n\n{}",
                summary.chunk_index,
                summary.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Number of chunk sections in a persisted concatenation, read from the total in the first
/// `## Chunk {i} of {N}` marker. Headings inside summary text never come before it.
pub(crate) fn count_parts(raw: &str) -> usize {
    raw.lines()
        .find_map(parse_marker)
        .map_or(0, |(_, total)| total)
}

fn parse_marker(line: &str) -> Option<(usize, usize)> {
    let (index, total) = line.strip_prefix(CHUNK_MARKER)?.split_once(" of ")?;
    Some((index.parse().ok()?, total.trim_end().parse().ok()?))
}
