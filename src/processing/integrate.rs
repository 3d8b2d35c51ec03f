//! Integrated case report built from every per-document summary in an output directory.

use super::artifacts::{exists, write_atomic};
use super::prompt::{self, PromptContext};
use super::service::PipelineContext;
use crate::provider::ProviderError;
use crate::retry::RetryError;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// File name of the integrated report.
pub const INTEGRATED_REPORT_FILE: &str = "integrated_analysis.md";
const INTEGRATED_REASONING_FILE: &str = "integrated_analysis_reasoning.md";
const SUMMARY_SUFFIX: &str = "_summary.md";

/// Errors raised while building the integrated report.
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// No `*_summary.md` files were found.
    #[error("no document summaries found in '{0}'")]
    NoSummaries(PathBuf),
    /// Reading summaries or writing the report failed.
    #[error("failed to access '{path}': {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The generation call failed after retries.
    #[error("integrated analysis generation failed: {0}")]
    Generation(#[source] RetryError<ProviderError>),
}

/// What [`IntegratedReport::generate`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationStatus {
    /// Report written to the path.
    Written(PathBuf),
    /// Report already existed and `force` was not set.
    Skipped(PathBuf),
}

/// Builds `integrated_analysis.md` from the summaries in an output directory.
pub struct IntegratedReport<'a> {
    context: &'a PipelineContext,
    prompt: &'a PromptContext,
}

impl<'a> IntegratedReport<'a> {
    /// Report builder sharing the pipeline's providers and retry policy.
    pub fn new(context: &'a PipelineContext, prompt: &'a PromptContext) -> Self {
        Self { context, prompt }
    }

    /// Generate the report unless it exists and `force` is false.
    pub async fn generate(
        &self,
        output_dir: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<IntegrationStatus, IntegrationError> {
        let target = output_dir.join(INTEGRATED_REPORT_FILE);
        let present = exists(&target).await.map_err(|source| IntegrationError::Io {
            path: target.clone(),
            source,
        })?;
        if present && !force {
            tracing::info!(path = %target.display(), "Integrated report exists; skipping");
            return Ok(IntegrationStatus::Skipped(target));
        }

        let summaries = load_summaries(output_dir).await?;
        if summaries.is_empty() {
            return Err(IntegrationError::NoSummaries(output_dir.to_path_buf()));
        }
        let combined = summaries
            .iter()
            .map(|(name, text)| format!("# Document: {name}\n\n{}", text.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");

        let estimate = self
            .context
            .estimator
            .estimate(self.context.registry.primary().as_ref(), &combined)
            .await;
        tracing::info!(
            documents = summaries.len(),
            estimated_tokens = estimate.tokens,
            "Generating integrated analysis"
        );
        let request = self.context.request(prompt::integration_prompt(
            self.prompt,
            summaries.len(),
            &combined,
        ));
        let generated = self
            .context
            .generate("integrated analysis", estimate.tokens, &request, cancel)
            .await
            .map_err(IntegrationError::Generation)?;

        if let Some(thinking) = generated.thinking.as_deref() {
            let reasoning = output_dir.join(INTEGRATED_REASONING_FILE);
            write_atomic(&reasoning, thinking)
                .await
                .map_err(|source| IntegrationError::Io {
                    path: reasoning.clone(),
                    source,
                })?;
        }
        write_atomic(&target, &generated.content)
            .await
            .map_err(|source| IntegrationError::Io {
                path: target.clone(),
                source,
            })?;
        tracing::info!(path = %target.display(), "Integrated report written");
        Ok(IntegrationStatus::Written(target))
    }
}

/// `(basename, text)` for every summary file, ordered by file name.
async fn load_summaries(output_dir: &Path) -> Result<Vec<(String, String)>, IntegrationError> {
    let io_error = |source| IntegrationError::Io {
        path: output_dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(output_dir).await.map_err(io_error)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(SUMMARY_SUFFIX) && !name.starts_with('.') {
            paths.push((name, entry.path()));
        }
    }
    paths.sort();

    let mut summaries = Vec::with_capacity(paths.len());
    for (name, path) in paths {
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| IntegrationError::Io {
                path: path.clone(),
                source,
            })?;
        let basename = name.trim_end_matches(SUMMARY_SUFFIX).to_string();
        summaries.push((basename, text));
    }
    Ok(summaries)
}
