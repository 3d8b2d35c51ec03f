//! One-way progress notifications from the pipeline to its caller.

use super::types::{PipelineError, PipelineResult};
use tokio::sync::mpsc;

/// Receives pipeline notifications. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    /// Percentage through the current document, with a short status message.
    fn on_progress(&self, percent: u8, message: &str);

    /// A document reached `Succeeded`, `Skipped` or `Cancelled`.
    fn on_completed(&self, result: &PipelineResult);

    /// A document failed.
    fn on_failed(&self, document_id: &str, error: &PipelineError);
}

/// Sink that drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_progress(&self, _percent: u8, _message: &str) {}

    fn on_completed(&self, _result: &PipelineResult) {}

    fn on_failed(&self, _document_id: &str, _error: &PipelineError) {}
}

/// Notification forwarded over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Progress update.
    Progress {
        /// Percentage through the current document.
        percent: u8,
        /// Status message.
        message: String,
    },
    /// Terminal non-failure result.
    Completed(PipelineResult),
    /// Document failure.
    Failed {
        /// Failed document.
        document_id: String,
        /// Rendered error.
        error: String,
    },
}

/// Forwards notifications to an unbounded `mpsc` channel.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelProgress {
    /// Create a sink plus the receiver the presentation layer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: PipelineEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.sender.send(event);
    }
}

impl ProgressSink for ChannelProgress {
    fn on_progress(&self, percent: u8, message: &str) {
        self.send(PipelineEvent::Progress {
            percent,
            message: message.to_string(),
        });
    }

    fn on_completed(&self, result: &PipelineResult) {
        self.send(PipelineEvent::Completed(result.clone()));
    }

    fn on_failed(&self, document_id: &str, error: &PipelineError) {
        self.send(PipelineEvent::Failed {
            document_id: document_id.to_string(),
            error: error.to_string(),
        });
    }
}
