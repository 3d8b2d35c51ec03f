//! On-disk artifact naming and atomic writes.
//!
//! Names are a contract with other tooling:
//!
//! - `<basename>_summary.md`: the final summary and the only idempotence signal.
//! - `<basename>_combined_chunks.md`: raw chunk summaries, written before any merge attempt.
//! - `<basename>_summary_reasoning.md`: extended-thinking trace, when one was returned.

use super::types::PipelineError;
use std::io;
use std::path::{Path, PathBuf};

/// Artifact locations for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Final summary.
    pub summary: PathBuf,
    /// Recovery artifact for the chunked path.
    pub combined_chunks: PathBuf,
    /// Reasoning trace.
    pub reasoning: PathBuf,
}

impl ArtifactPaths {
    /// Paths for `basename` inside `output_dir`.
    pub fn new(output_dir: &Path, basename: &str) -> Self {
        Self {
            summary: output_dir.join(format!("{basename}_summary.md")),
            combined_chunks: output_dir.join(format!("{basename}_combined_chunks.md")),
            reasoning: output_dir.join(format!("{basename}_summary_reasoning.md")),
        }
    }
}

/// Write `contents` to a temporary sibling and rename it into place.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&staging, contents).await?;
    if let Err(error) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(error);
    }
    Ok(())
}

/// Read an artifact, treating a missing file as `None`.
pub(crate) async fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

pub(crate) async fn exists(path: &Path) -> io::Result<bool> {
    tokio::fs::try_exists(path).await
}

pub(crate) fn artifact_error(path: &Path) -> impl FnOnce(io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Artifact {
        path: path.to_path_buf(),
        source,
    }
}
