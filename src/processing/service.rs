//! Pipeline orchestration: skip checks, single-shot vs chunked paths, merge and persistence.

use super::artifacts::{ArtifactPaths, artifact_error, exists, read_optional, write_atomic};
use super::chunking::DocumentChunker;
use super::merge::{HierarchicalMerger, MergeOutcome, count_parts};
use super::progress::ProgressSink;
use super::prompt::PromptContext;
use super::summarize::{ChunkSummarizer, Generated};
use super::types::{Document, PipelineError, PipelineResult, PipelineStatus, TokenBudget};
use crate::config::{Config, ConfigError, GenerationSettings};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::provider::{ProviderRegistry, ProviderSelector};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::tokens::TokenEstimator;
use futures_util::{StreamExt, stream};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

const INPUT_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];
const ARTIFACT_SUFFIXES: &[&str] = &[
    "_summary.md",
    "_combined_chunks.md",
    "_summary_reasoning.md",
];

/// Everything a pipeline run needs, passed explicitly instead of living in globals.
///
/// The token cache inside [`TokenEstimator`] is scoped to this value, so a fresh context
/// starts with a cold cache.
pub struct PipelineContext {
    /// Configured providers.
    pub registry: ProviderRegistry,
    /// Chunk and merge budgets.
    pub budget: TokenBudget,
    /// Generation parameters for every request.
    pub generation: GenerationSettings,
    /// Retry executor shared by every provider call.
    pub retry: RetryExecutor,
    /// Token estimator and its cache.
    pub estimator: TokenEstimator,
    /// Provider selection by input size.
    pub selector: ProviderSelector,
    /// Run counters.
    pub metrics: Arc<PipelineMetrics>,
    /// Maximum chunk calls in flight for one document.
    pub chunk_concurrency: usize,
    /// Deadline applied to each individual provider request.
    pub request_timeout: Duration,
}

impl PipelineContext {
    /// Build providers and helpers from configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = ProviderRegistry::from_config(config)?;
        let estimator = TokenEstimator::from_config(config)?;
        Ok(Self::new(registry, config).with_estimator(estimator))
    }

    /// Context around an already built registry, using the character-ratio estimator.
    pub fn new(registry: ProviderRegistry, config: &Config) -> Self {
        Self {
            registry,
            budget: config.budget,
            generation: config.generation,
            retry: RetryExecutor::new(RetryPolicy::from_settings(&config.retry)),
            estimator: TokenEstimator::new(config.chars_per_token, config.retry.request_timeout),
            selector: ProviderSelector::new(config.selector_safety_margin_tokens),
            metrics: Arc::new(PipelineMetrics::new()),
            chunk_concurrency: config.chunk_concurrency.max(1),
            request_timeout: config.retry.request_timeout,
        }
    }

    /// Replace the token estimator.
    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }
}

/// Per-document summarization pipeline.
///
/// State machine per document:
/// `Pending -> SkipCheck -> {Skipped | SingleShot | Chunked} -> {Succeeded | Failed | Cancelled}`.
pub struct Pipeline {
    context: PipelineContext,
}

impl Pipeline {
    /// Wrap a context.
    pub fn new(context: PipelineContext) -> Self {
        Self { context }
    }

    /// Shared context.
    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Counters accumulated so far.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.context.metrics.snapshot()
    }

    /// Process one document into `output_dir`.
    ///
    /// Never returns an error: failures become a `Failed` result plus an `on_failed`
    /// notification.
    pub async fn process_document(
        &self,
        document: &Document,
        output_dir: &Path,
        prompt: &PromptContext,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let paths = ArtifactPaths::new(output_dir, &document.id);
        tracing::info!(
            document = %document.id,
            source = %document.source_path.display(),
            "Processing document"
        );
        let outcome = self.run(document, &paths, prompt, progress, cancel).await;
        self.finish(&document.id, paths.summary, outcome, progress)
    }

    /// Process inputs one document at a time. Directories are walked for markdown and text
    /// files; cancellation stops the batch between documents.
    ///
    /// Artifacts are named after the file stem, so an input whose stem was already claimed by
    /// an earlier input fails with [`PipelineError::DuplicateBasename`] instead of being
    /// reported as skipped.
    pub async fn process_batch(
        &self,
        inputs: &[PathBuf],
        output_dir: &Path,
        prompt: &PromptContext,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Vec<PipelineResult> {
        let files = collect_inputs(inputs);
        tracing::info!(documents = files.len(), "Starting batch");
        let mut results = Vec::with_capacity(files.len());
        let mut claimed: HashMap<String, PathBuf> = HashMap::new();

        for path in files {
            let document_id = document_id_for(&path);
            if let Some(existing) = claimed.get(&document_id) {
                let paths = ArtifactPaths::new(output_dir, &document_id);
                let error = PipelineError::DuplicateBasename {
                    path: path.clone(),
                    existing: existing.clone(),
                };
                results.push(self.finish(&document_id, paths.summary, Err(error), progress));
                continue;
            }
            claimed.insert(document_id.clone(), path.clone());
            if cancel.is_cancelled() {
                let paths = ArtifactPaths::new(output_dir, &document_id);
                results.push(self.finish(
                    &document_id,
                    paths.summary,
                    Err(PipelineError::Cancelled),
                    progress,
                ));
                continue;
            }
            let result = match Document::load(&path).await {
                Ok(document) => {
                    self.process_document(&document, output_dir, prompt, progress, cancel)
                        .await
                }
                Err(error) => {
                    let paths = ArtifactPaths::new(output_dir, &document_id);
                    self.finish(&document_id, paths.summary, Err(error), progress)
                }
            };
            results.push(result);
        }
        results
    }

    fn finish(
        &self,
        document_id: &str,
        output_path: PathBuf,
        outcome: Result<PipelineStatus, PipelineError>,
        progress: &dyn ProgressSink,
    ) -> PipelineResult {
        let result = match outcome {
            Ok(status) => {
                let result = PipelineResult::new(document_id, status, output_path);
                progress.on_completed(&result);
                result
            }
            Err(error) if error.is_cancelled() => {
                tracing::info!(document = document_id, "Document cancelled");
                let result =
                    PipelineResult::new(document_id, PipelineStatus::Cancelled, output_path)
                        .with_error(&error);
                progress.on_completed(&result);
                result
            }
            Err(error) => {
                tracing::error!(document = document_id, error = %error, "Document failed");
                progress.on_failed(document_id, &error);
                PipelineResult::new(document_id, PipelineStatus::Failed, output_path)
                    .with_error(&error)
            }
        };
        self.context.metrics.record_document(result.status);
        result
    }

    async fn run(
        &self,
        document: &Document,
        paths: &ArtifactPaths,
        prompt: &PromptContext,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PipelineStatus, PipelineError> {
        progress.on_progress(0, &format!("{}: checking for existing summary", document.id));
        if exists(&paths.summary)
            .await
            .map_err(artifact_error(&paths.summary))?
        {
            tracing::info!(
                document = %document.id,
                path = %paths.summary.display(),
                "Summary exists; skipping"
            );
            progress.on_progress(100, &format!("{}: summary already exists", document.id));
            return Ok(PipelineStatus::Skipped);
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let merger = HierarchicalMerger::new(&self.context, prompt, &document.id);
        let recovered = read_optional(&paths.combined_chunks)
            .await
            .map_err(artifact_error(&paths.combined_chunks))?;
        if let Some(raw) = recovered {
            tracing::info!(
                document = %document.id,
                path = %paths.combined_chunks.display(),
                "Resuming from combined chunk summaries"
            );
            progress.on_progress(
                80,
                &format!("{}: resuming merge from saved chunk summaries", document.id),
            );
            let parts = count_parts(&raw);
            let outcome = merger.merge_concatenated(raw, parts, cancel).await?;
            return self.persist_merge(document, paths, outcome, progress).await;
        }

        progress.on_progress(10, &format!("{}: estimating document size", document.id));
        let primary = Arc::clone(self.context.registry.primary());
        let estimate = self
            .context
            .estimator
            .estimate(primary.as_ref(), &document.raw_text)
            .await;
        let limit = self.context.budget.chunk_limit();
        tracing::debug!(
            document = %document.id,
            estimated_tokens = estimate.tokens,
            approximate = estimate.approximate,
            limit,
            "Estimated document size"
        );

        if estimate.tokens <= limit {
            progress.on_progress(20, &format!("{}: generating summary", document.id));
            let generated = ChunkSummarizer::new(&self.context, prompt, &document.id, 1)
                .summarize_document(document, estimate.tokens, cancel)
                .await?;
            return self.persist_single(document, paths, generated, progress).await;
        }

        progress.on_progress(15, &format!("{}: splitting into chunks", document.id));
        let chunker = DocumentChunker::new(
            &self.context.estimator,
            primary.as_ref(),
            self.context.budget,
        );
        let chunks = chunker.chunk(document, cancel).await?;
        let total = chunks.len();
        let summarizer = ChunkSummarizer::new(&self.context, prompt, &document.id, total);
        progress.on_progress(20, &format!("{}: summarizing {total} chunks", document.id));

        let chunk_futures: Vec<_> = chunks
            .iter()
            .map(|chunk| summarizer.summarize(chunk, cancel))
            .collect();
        let mut pending = stream::iter(chunk_futures).buffered(self.context.chunk_concurrency);
        let mut summaries = Vec::with_capacity(total);
        while let Some(summary) = pending.next().await {
            summaries.push(summary?);
            let done = summaries.len();
            progress.on_progress(
                20 + percent_of(done, total, 60),
                &format!("{}: summarized chunk {done} of {total}", document.id),
            );
            if cancel.is_cancelled() && done < total {
                return Err(PipelineError::Cancelled);
            }
        }
        drop(pending);

        progress.on_progress(85, &format!("{}: combining chunk summaries", document.id));
        let outcome = merger.merge(summaries, &paths.combined_chunks, cancel).await?;
        self.persist_merge(document, paths, outcome, progress).await
    }

    async fn persist_single(
        &self,
        document: &Document,
        paths: &ArtifactPaths,
        generated: Generated,
        progress: &dyn ProgressSink,
    ) -> Result<PipelineStatus, PipelineError> {
        self.persist(document, paths, &generated.content, generated.thinking.as_deref(), progress)
            .await
    }

    async fn persist_merge(
        &self,
        document: &Document,
        paths: &ArtifactPaths,
        outcome: MergeOutcome,
        progress: &dyn ProgressSink,
    ) -> Result<PipelineStatus, PipelineError> {
        let text = outcome.artifact.final_text();
        self.persist(document, paths, &text, outcome.thinking.as_deref(), progress)
            .await
    }

    async fn persist(
        &self,
        document: &Document,
        paths: &ArtifactPaths,
        summary: &str,
        thinking: Option<&str>,
        progress: &dyn ProgressSink,
    ) -> Result<PipelineStatus, PipelineError> {
        if let Some(thinking) = thinking {
            write_atomic(&paths.reasoning, thinking)
                .await
                .map_err(artifact_error(&paths.reasoning))?;
        }
        write_atomic(&paths.summary, summary)
            .await
            .map_err(artifact_error(&paths.summary))?;
        tracing::info!(
            document = %document.id,
            path = %paths.summary.display(),
            "Summary written"
        );
        progress.on_progress(100, &format!("{}: summary written", document.id));
        Ok(PipelineStatus::Succeeded)
    }
}

fn percent_of(done: usize, total: usize, span: u8) -> u8 {
    if total == 0 {
        return span;
    }
    ((done * usize::from(span)) / total).min(usize::from(span)) as u8
}

fn document_id_for(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

/// Expand inputs into document files: explicit files are kept as given, directories are walked
/// in file-name order for `.md`, `.markdown` and `.txt` files that are not pipeline outputs.
pub fn collect_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if !input.is_dir() {
            files.push(input.clone());
            continue;
        }
        for entry in WalkDir::new(input)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    tracing::warn!(error = %error, "Skipping unreadable input entry");
                    None
                }
            })
        {
            if entry.file_type().is_file() && is_document(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    files
}

fn is_document(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    let extension_ok = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            INPUT_EXTENSIONS
                .iter()
                .any(|allowed| extension.eq_ignore_ascii_case(allowed))
        });
    extension_ok
        && !name.starts_with('.')
        && !ARTIFACT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        && name != "integrated_analysis.md"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::processing::{ChannelProgress, PipelineEvent};
    use crate::provider::testing::StaticProvider;

    #[test]
    fn percent_of_scales_into_span() {
        assert_eq!(percent_of(0, 4, 60), 0);
        assert_eq!(percent_of(2, 4, 60), 30);
        assert_eq!(percent_of(4, 4, 60), 60);
        assert_eq!(percent_of(0, 0, 60), 60);
    }

    #[test]
    fn collect_inputs_walks_directories_and_skips_outputs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir(root.join("nested")).expect("mkdir");
        for name in [
            "b_records.md",
            "a_interview.txt",
            "nested/c_notes.markdown",
            "image.png",
            "a_interview_summary.md",
            "a_interview_combined_chunks.md",
            "integrated_analysis.md",
            ".hidden.md",
        ] {
            std::fs::write(root.join(name), "text").expect("write");
        }
        let explicit = root.join("image.png");

        let files = collect_inputs(&[root.to_path_buf(), explicit.clone()]);
        let names: Vec<_> = files
            .iter()
            .map(|path| path.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["a_interview.txt", "b_records.md", "c_notes.markdown", "image.png"]
        );
        assert_eq!(files.last(), Some(&explicit));
    }

    #[tokio::test]
    async fn batch_rejects_inputs_sharing_a_basename() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let output = tempfile::tempdir().expect("tempdir");
        let root = inputs.path();
        std::fs::create_dir(root.join("x")).expect("mkdir");
        std::fs::create_dir(root.join("y")).expect("mkdir");
        std::fs::write(root.join("x/notes.md"), "patient one interview").expect("write");
        std::fs::write(root.join("y/notes.md"), "patient two interview").expect("write");
        std::fs::write(root.join("intake.md"), "alpha intake form").expect("write");
        std::fs::write(root.join("intake.txt"), "beta intake form").expect("write");

        let provider = Arc::new(StaticProvider::new("primary", 200_000));
        let registry = ProviderRegistry::new(provider.clone(), None);
        let pipeline = Pipeline::new(PipelineContext::new(registry, &sample_config()));
        let (progress, mut events) = ChannelProgress::channel();

        let results = pipeline
            .process_batch(
                &[root.to_path_buf()],
                output.path(),
                &PromptContext::default(),
                &progress,
                &CancellationToken::new(),
            )
            .await;

        let outcomes: Vec<_> = results
            .iter()
            .map(|result| (result.document_id.as_str(), result.status))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ("intake", PipelineStatus::Succeeded),
                ("intake", PipelineStatus::Failed),
                ("notes", PipelineStatus::Succeeded),
                ("notes", PipelineStatus::Failed),
            ]
        );
        let error = results[3].error.as_deref().expect("error");
        assert!(error.contains("y/notes.md") || error.contains("y\\notes.md"));
        assert_eq!(provider.generate_calls(), 2);
        let prompts = provider.prompts.lock().expect("prompts lock").join("\n");
        assert!(prompts.contains("patient one"));
        assert!(!prompts.contains("patient two"));
        assert!(!prompts.contains("beta intake"));

        drop(progress);
        let mut failed = Vec::new();
        while let Some(event) = events.recv().await {
            if let PipelineEvent::Failed { document_id, .. } = event {
                failed.push(document_id);
            }
        }
        assert_eq!(failed, vec!["intake", "notes"]);
        assert_eq!(pipeline.metrics_snapshot().documents_failed, 2);
    }
}
