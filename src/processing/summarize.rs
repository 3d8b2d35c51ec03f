//! Per-chunk and single-shot summarization calls.
//!
//! Every call here selects a provider for its input size, then runs the generation through the
//! shared [`RetryExecutor`](crate::retry::RetryExecutor) with the per-request timeout applied to
//! each attempt.

use super::prompt::{self, PromptContext};
use super::service::PipelineContext;
use super::types::{Chunk, ChunkSummary, Document, PipelineError};
use crate::provider::{
    GenerationRequest, ProviderCapability, ProviderError, Usage, call_with_timeout,
};
use crate::retry::RetryError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Output of one retried generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    /// Final answer text.
    pub content: String,
    /// Reasoning trace, when extended thinking was enabled.
    pub thinking: Option<String>,
    /// Provider that answered.
    pub provider: String,
    /// Usage reported by the provider.
    pub usage: Usage,
}

impl PipelineContext {
    /// Build a request from the shared generation settings.
    pub(crate) fn request(&self, prompt: String) -> GenerationRequest {
        GenerationRequest {
            prompt,
            system_prompt: Some(prompt::SYSTEM_PROMPT.to_string()),
            model: None,
            max_tokens: self.generation.max_output_tokens,
            temperature: self.generation.temperature,
            thinking_budget_tokens: self.generation.thinking_budget_tokens,
        }
    }

    /// Select a provider for `estimated_tokens` and run `request` through the retry executor.
    pub(crate) async fn generate(
        &self,
        label: &str,
        estimated_tokens: usize,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Generated, RetryError<ProviderError>> {
        let selection = self.selector.select(estimated_tokens, &self.registry);
        let provider: Arc<dyn ProviderCapability> = selection.provider;
        let timeout = self.request_timeout;

        tracing::debug!(
            operation = label,
            provider = provider.name(),
            role = %selection.role,
            estimated_tokens,
            "Dispatching generation request"
        );
        let outcome = self
            .retry
            .execute(label, cancel, |_| {
                let provider = Arc::clone(&provider);
                async move { call_with_timeout(timeout, provider.generate(request)).await }
            })
            .await;

        match outcome {
            Ok(retried) => {
                let usage = retried.value.usage.unwrap_or_default();
                self.metrics.record_retries(retried.attempts - 1);
                self.metrics
                    .record_generation(usage.input_tokens, usage.output_tokens);
                Ok(Generated {
                    content: retried.value.content,
                    thinking: retried.value.thinking.filter(|text| !text.trim().is_empty()),
                    provider: provider.name().to_string(),
                    usage,
                })
            }
            Err(error) => {
                self.metrics
                    .record_retries(error.attempts().saturating_sub(1));
                Err(error)
            }
        }
    }
}

/// Produces one summary per chunk of a document.
pub struct ChunkSummarizer<'a> {
    context: &'a PipelineContext,
    prompt: &'a PromptContext,
    document_id: &'a str,
    total_chunks: usize,
}

impl<'a> ChunkSummarizer<'a> {
    /// Summarizer for a document split into `total_chunks` chunks.
    pub fn new(
        context: &'a PipelineContext,
        prompt: &'a PromptContext,
        document_id: &'a str,
        total_chunks: usize,
    ) -> Self {
        Self {
            context,
            prompt,
            document_id,
            total_chunks,
        }
    }

    /// Summarize one chunk. Exhausted retries surface as [`PipelineError::ChunkFailed`].
    pub async fn summarize(
        &self,
        chunk: &Chunk,
        cancel: &CancellationToken,
    ) -> Result<ChunkSummary, PipelineError> {
        let request = self.context.request(prompt::chunk_prompt(
            self.prompt,
            self.document_id,
            chunk.index,
            self.total_chunks,
            &chunk.text,
        ));
        let label = format!("{} chunk {}/{}", self.document_id, chunk.index, self.total_chunks);
        let generated = self
            .context
            .generate(&label, chunk.estimated_tokens, &request, cancel)
            .await
            .map_err(|source| PipelineError::ChunkFailed {
                index: chunk.index,
                source,
            })?;

        self.context.metrics.record_chunk();
        tracing::info!(
            document = self.document_id,
            chunk = chunk.index,
            total = self.total_chunks,
            provider = %generated.provider,
            output_tokens = generated.usage.output_tokens,
            "Chunk summarized"
        );
        Ok(ChunkSummary {
            chunk_index: chunk.index,
            content: generated.content,
            provider_used: generated.provider,
            usage: generated.usage,
        })
    }

    /// Summarize a whole document in one call, without chunking.
    pub async fn summarize_document(
        &self,
        document: &Document,
        estimated_tokens: usize,
        cancel: &CancellationToken,
    ) -> Result<Generated, PipelineError> {
        let request =
            self.context
                .request(prompt::document_prompt(self.prompt, &document.id, &document.raw_text));
        let label = format!("{} single-shot", document.id);
        self.context
            .generate(&label, estimated_tokens, &request, cancel)
            .await
            .map_err(PipelineError::SingleShot)
    }
}
