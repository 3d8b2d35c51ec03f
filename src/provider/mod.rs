//! Generation providers behind a single capability interface.
//!
//! The pipeline never depends on a concrete backend: everything downstream talks to
//! [`ProviderCapability`], and the [`ProviderRegistry`] hands out the primary or fallback
//! implementation. HTTP adapters for Anthropic and Gemini live in submodules and translate
//! transport failures into [`ProviderError`] variants that carry the retry classification.

mod anthropic;
mod gemini;
pub mod registry;
pub mod selector;
#[cfg(test)]
pub(crate) mod testing;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use registry::{ProviderRegistry, ProviderRole};
pub use selector::{ProviderSelector, Selection};

use crate::config::{ConfigError, ProviderKind, ProviderSettings};
use crate::retry::{Classify, ErrorClass};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by provider calls.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Request exceeded its per-call deadline.
    #[error("Provider request timed out after {0:?}")]
    Timeout(Duration),
    /// Transport failed before a response arrived.
    #[error("Connection to provider failed: {0}")]
    Connection(String),
    /// Provider throttled the request.
    #[error("Rate limited by provider: {message}")]
    RateLimited {
        /// Server-suggested wait, when advertised.
        retry_after: Option<Duration>,
        /// Body or reason returned by the provider.
        message: String,
    },
    /// Provider returned a non-success status not covered by other variants.
    #[error("Provider returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: StatusCode,
        /// Response body, truncated for display.
        body: String,
    },
    /// Credentials were missing or rejected.
    #[error("Provider rejected credentials: {0}")]
    Authentication(String),
    /// Request payload was rejected as malformed.
    #[error("Provider rejected request: {0}")]
    InvalidRequest(String),
    /// Response arrived but did not have the expected shape.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
    /// Capability is not offered by this provider.
    #[error("Provider does not support {0}")]
    Unsupported(&'static str),
    /// Any other failure; classified by inspecting its message.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Map a non-success HTTP status onto the error taxonomy.
    pub fn from_status(status: StatusCode, headers: &HeaderMap, body: String) -> Self {
        let body = truncate_body(&body);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Authentication(body),
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited {
                retry_after: parse_retry_after(headers),
                message: body,
            },
            StatusCode::BAD_REQUEST
            | StatusCode::NOT_FOUND
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::UNPROCESSABLE_ENTITY => Self::InvalidRequest(format!("{status}: {body}")),
            _ => Self::Status { status, body },
        }
    }

    /// Map a transport error raised by `reqwest`.
    pub fn from_transport(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            Self::Timeout(timeout)
        } else if error.is_connect() || error.is_request() {
            Self::Connection(error.to_string())
        } else if error.is_decode() {
            Self::InvalidResponse(error.to_string())
        } else {
            Self::Other(error.to_string())
        }
    }
}

impl Classify for ProviderError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::Connection(_) | Self::RateLimited { .. } => {
                ErrorClass::Retryable
            }
            Self::Status { status, .. } => match status.as_u16() {
                429 | 500 | 502 | 503 | 504 => ErrorClass::Retryable,
                _ => ErrorClass::Fatal,
            },
            Self::Authentication(_)
            | Self::InvalidRequest(_)
            | Self::InvalidResponse(_)
            | Self::Unsupported(_) => ErrorClass::Fatal,
            Self::Other(message) => classify_message(message),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Classify a free-form error message by the signals it mentions.
pub(crate) fn classify_message(message: &str) -> ErrorClass {
    const RETRYABLE_SIGNALS: &[&str] = &[
        "timeout",
        "timed out",
        "connection",
        "rate limit",
        "rate_limit",
        "overloaded",
        "429",
        "500",
        "502",
        "503",
        "504",
    ];
    let lowered = message.to_lowercase();
    if RETRYABLE_SIGNALS
        .iter()
        .any(|signal| lowered.contains(signal))
    {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn truncate_body(body: &str) -> String {
    const MAX_BODY_CHARS: usize = 500;
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_BODY_CHARS {
        return trimmed.to_string();
    }
    let mut truncated: String = trimmed.chars().take(MAX_BODY_CHARS).collect();
    truncated.push_str("...");
    truncated
}

/// Speaker of a structured message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Caller-authored content.
    User,
    /// Model-authored content.
    Assistant,
}

impl Role {
    /// Wire name shared by the supported APIs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One entry of a structured conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Speaker.
    pub role: Role,
    /// Text content.
    pub content: String,
}

impl Message {
    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Request payload for a generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// User prompt.
    pub prompt: String,
    /// Optional system instructions.
    pub system_prompt: Option<String>,
    /// Model override; providers fall back to their configured model.
    pub model: Option<String>,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Sampling temperature.
    pub temperature: f32,
    /// Extended-thinking budget, when enabled.
    pub thinking_budget_tokens: Option<usize>,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Tokens generated.
    pub output_tokens: u64,
}

/// Successful generation output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationResponse {
    /// Final answer text.
    pub content: String,
    /// Reasoning trace returned in extended-thinking mode.
    pub thinking: Option<String>,
    /// Usage, when the provider reports it.
    pub usage: Option<Usage>,
}

/// Input accepted by the token-count capability.
#[derive(Debug, Clone, Copy)]
pub enum TokenCountInput<'a> {
    /// Plain text counted as a single user message.
    Text(&'a str),
    /// Structured message list.
    Messages(&'a [Message]),
}

impl TokenCountInput<'_> {
    /// Materialize the input as an owned message list.
    pub fn to_messages(self) -> Vec<Message> {
        match self {
            Self::Text(text) => vec![Message::user(text)],
            Self::Messages(messages) => messages.to_vec(),
        }
    }
}

/// Interface implemented by every generation backend.
#[async_trait]
pub trait ProviderCapability: Send + Sync {
    /// Stable provider name used for logging and cache keys.
    fn name(&self) -> &str;

    /// Maximum input tokens the backing model accepts.
    fn context_window_tokens(&self) -> usize;

    /// Produce a completion for the request.
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError>;

    /// Count tokens exactly as the provider would bill them.
    async fn count_tokens(&self, input: TokenCountInput<'_>) -> Result<usize, ProviderError>;
}

/// Run a provider future under a per-request deadline.
pub async fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}

/// Construct a provider from its settings.
///
/// Initialization failure is a configuration error; callers must not silently substitute a
/// different provider.
pub fn build_provider(
    role: ProviderRole,
    settings: &ProviderSettings,
    request_timeout: Duration,
) -> Result<Arc<dyn ProviderCapability>, ConfigError> {
    let provider: Arc<dyn ProviderCapability> = match settings.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(settings, request_timeout)?),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(settings, request_timeout)?),
    };
    tracing::info!(
        role = %role,
        provider = provider.name(),
        model = %settings.model,
        context_window = provider.context_window_tokens(),
        "Initialized provider"
    );
    Ok(provider)
}

pub(crate) fn require_api_key(
    settings: &ProviderSettings,
) -> Result<String, ConfigError> {
    settings.api_key.clone().ok_or_else(|| ConfigError::ProviderInit {
        name: settings.kind.to_string(),
        reason: format!(
            "no API key configured (set {} or the role-specific *_API_KEY)",
            settings.kind.api_key_variable()
        ),
    })
}

pub(crate) fn build_http_client(
    settings: &ProviderSettings,
    request_timeout: Duration,
) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .user_agent("casedraft/0.1")
        .timeout(request_timeout)
        .build()
        .map_err(|error| ConfigError::ProviderInit {
            name: settings.kind.to_string(),
            reason: error.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn status_mapping_follows_taxonomy() {
        let headers = HeaderMap::new();
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, &headers, "nope".into()),
            ProviderError::Authentication(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_REQUEST, &headers, "bad".into()),
            ProviderError::InvalidRequest(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, &headers, "".into()),
            ProviderError::Status { .. }
        ));
    }

    #[test]
    fn rate_limit_reads_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let error =
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, &headers, "slow".into());
        assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(error.class(), ErrorClass::Retryable);
    }

    #[test]
    fn retryable_statuses_are_classified() {
        for code in [500u16, 502, 503, 504] {
            let error = ProviderError::Status {
                status: StatusCode::from_u16(code).unwrap(),
                body: String::new(),
            };
            assert_eq!(error.class(), ErrorClass::Retryable, "status {code}");
        }
        let error = ProviderError::Status {
            status: StatusCode::from_u16(418).unwrap(),
            body: String::new(),
        };
        assert_eq!(error.class(), ErrorClass::Fatal);
    }

    #[test]
    fn fatal_variants_never_retry() {
        assert_eq!(
            ProviderError::Authentication("bad key".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            ProviderError::InvalidRequest("bad".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            ProviderError::Unsupported("token counting").class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn other_errors_are_classified_by_message() {
        assert_eq!(
            ProviderError::Other("upstream connection reset".into()).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            ProviderError::Other("HTTP 503 Service Unavailable".into()).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            ProviderError::Other("unexpected field".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2_000);
        let truncated = truncate_body(&body);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), 503);
    }

    #[tokio::test(start_paused = true)]
    async fn call_with_timeout_maps_expiry() {
        let result: Result<(), ProviderError> =
            call_with_timeout(Duration::from_secs(1), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
    }
}
