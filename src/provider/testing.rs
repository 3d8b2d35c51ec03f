//! In-memory provider used by unit tests.

use super::{
    GenerationRequest, GenerationResponse, ProviderCapability, ProviderError, TokenCountInput,
    Usage,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

type Responder = Box<dyn Fn(&GenerationRequest) -> String + Send + Sync>;

/// How the fake answers `count_tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CountMode {
    /// One token per whitespace-separated word.
    Words,
    /// Capability missing.
    Unsupported,
    /// Transient failure on every call.
    Failing,
}

pub(crate) struct StaticProvider {
    name: String,
    window: usize,
    count_mode: CountMode,
    responder: Responder,
    failures: Mutex<VecDeque<ProviderError>>,
    pub(crate) generate_calls: AtomicUsize,
    pub(crate) count_calls: AtomicUsize,
    pub(crate) prompts: Mutex<Vec<String>>,
}

impl StaticProvider {
    pub(crate) fn new(name: &str, window: usize) -> Self {
        let label = name.to_string();
        Self {
            name: name.to_string(),
            window,
            count_mode: CountMode::Words,
            responder: Box::new(move |request| {
                format!(
                    "[{label}] {} words",
                    request.prompt.split_whitespace().count()
                )
            }),
            failures: Mutex::new(VecDeque::new()),
            generate_calls: AtomicUsize::new(0),
            count_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_count_mode(mut self, mode: CountMode) -> Self {
        self.count_mode = mode;
        self
    }

    pub(crate) fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&GenerationRequest) -> String + Send + Sync + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    /// Queue errors returned by the next `generate` calls, in order.
    pub(crate) fn fail_next(self, errors: Vec<ProviderError>) -> Self {
        self.failures
            .lock()
            .expect("failures lock")
            .extend(errors);
        self
    }

    pub(crate) fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderCapability for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn context_window_tokens(&self) -> usize {
        self.window
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.clone());
        if let Some(error) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(error);
        }
        let content = (self.responder)(request);
        Ok(GenerationResponse {
            usage: Some(Usage {
                input_tokens: request.prompt.split_whitespace().count() as u64,
                output_tokens: content.split_whitespace().count() as u64,
            }),
            content,
            thinking: None,
        })
    }

    async fn count_tokens(&self, input: TokenCountInput<'_>) -> Result<usize, ProviderError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        match self.count_mode {
            CountMode::Words => Ok(input
                .to_messages()
                .iter()
                .map(|message| message.content.split_whitespace().count())
                .sum()),
            CountMode::Unsupported => Err(ProviderError::Unsupported("token counting")),
            CountMode::Failing => Err(ProviderError::Connection("count endpoint down".into())),
        }
    }
}
