use std::sync::atomic::{AtomicU64, Ordering};

use crate::processing::PipelineStatus;

/// Thread-safe counters describing pipeline activity for one run.
#[derive(Default)]
pub struct PipelineMetrics {
    documents_succeeded: AtomicU64,
    documents_skipped: AtomicU64,
    documents_failed: AtomicU64,
    documents_cancelled: AtomicU64,
    chunks_summarized: AtomicU64,
    merges_run: AtomicU64,
    merges_skipped: AtomicU64,
    provider_calls: AtomicU64,
    retries: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the terminal status of one document.
    pub fn record_document(&self, status: PipelineStatus) {
        let counter = match status {
            PipelineStatus::Succeeded => &self.documents_succeeded,
            PipelineStatus::Skipped => &self.documents_skipped,
            PipelineStatus::Failed => &self.documents_failed,
            PipelineStatus::Cancelled => &self.documents_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed chunk summary.
    pub fn record_chunk(&self) {
        self.chunks_summarized.fetch_add(1, Ordering::Relaxed);
    }

    /// Record whether a merge call ran or was skipped as oversized.
    pub fn record_merge(&self, skipped: bool) {
        let counter = if skipped {
            &self.merges_skipped
        } else {
            &self.merges_run
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful generation call and the usage it reported.
    pub fn record_generation(&self, input_tokens: u64, output_tokens: u64) {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens.fetch_add(input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(output_tokens, Ordering::Relaxed);
    }

    /// Record attempts beyond the first for one retried operation.
    pub fn record_retries(&self, retries: u32) {
        self.retries
            .fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_succeeded: self.documents_succeeded.load(Ordering::Relaxed),
            documents_skipped: self.documents_skipped.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            documents_cancelled: self.documents_cancelled.load(Ordering::Relaxed),
            chunks_summarized: self.chunks_summarized.load(Ordering::Relaxed),
            merges_run: self.merges_run.load(Ordering::Relaxed),
            merges_skipped: self.merges_skipped.load(Ordering::Relaxed),
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Documents that produced a summary in this run.
    pub documents_succeeded: u64,
    /// Documents skipped because their summary already existed.
    pub documents_skipped: u64,
    /// Documents that ended in failure.
    pub documents_failed: u64,
    /// Documents interrupted by cancellation.
    pub documents_cancelled: u64,
    /// Chunk summaries generated.
    pub chunks_summarized: u64,
    /// Merge calls issued.
    pub merges_run: u64,
    /// Merges skipped because the input exceeded the merge threshold.
    pub merges_skipped: u64,
    /// Successful generation calls.
    pub provider_calls: u64,
    /// Retry attempts beyond first attempts.
    pub retries: u64,
    /// Input tokens reported by providers.
    pub input_tokens: u64,
    /// Output tokens reported by providers.
    pub output_tokens: u64,
}
