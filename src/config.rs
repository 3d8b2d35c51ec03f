use std::env;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
    /// Values parsed individually but contradict each other.
    #[error("Invalid configuration: {0}")]
    Inconsistent(String),
    /// A provider could not be constructed from its settings.
    #[error("Failed to initialize provider '{name}': {reason}")]
    ProviderInit {
        /// Provider role or name that failed.
        name: String,
        /// Human-readable cause.
        reason: String,
    },
}

/// Supported generation backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    /// Anthropic Messages API.
    Anthropic,
    /// Google Gemini `generateContent` API.
    Gemini,
}

impl ProviderKind {
    /// Context window assumed when no explicit override is configured.
    pub fn default_context_window(self) -> usize {
        match self {
            Self::Anthropic => 200_000,
            Self::Gemini => 1_000_000,
        }
    }

    /// Model used when no explicit model is configured.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-5",
            Self::Gemini => "gemini-2.5-pro",
        }
    }

    /// Environment variable consulted for the API key when the role-specific one is unset.
    pub fn api_key_variable(self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

/// Connection settings for one configured provider.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Backend family.
    pub kind: ProviderKind,
    /// Model identifier sent with each request.
    pub model: String,
    /// API key; absence is a fatal initialization error.
    pub api_key: Option<String>,
    /// Optional base URL override (proxies, tests).
    pub base_url: Option<String>,
    /// Context window in tokens.
    pub context_window_tokens: usize,
}

/// Token budgets applied while chunking and merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSettings {
    /// Upper bound on tokens per model call input.
    pub max_chunk_tokens: usize,
    /// Headroom kept for prompt scaffolding and response.
    pub reserved_tokens: usize,
    /// Maximum size of the overlap carried into the next chunk.
    pub overlap_tokens: usize,
    /// Merge inputs above this estimate skip the unification call.
    pub merge_threshold_tokens: usize,
    /// Maximum trailing paragraphs repeated as overlap.
    pub max_overlap_paragraphs: usize,
    /// Paragraphs accumulated between token probes.
    pub probe_batch: usize,
}

/// Generation parameters shared by every provider call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    /// Maximum output tokens requested.
    pub max_output_tokens: usize,
    /// Sampling temperature.
    pub temperature: f32,
    /// Optional extended-thinking budget; must stay below `max_output_tokens`.
    pub thinking_budget_tokens: Option<usize>,
}

/// Retry and timeout settings for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// First backoff delay.
    pub initial_delay: Duration,
    /// Ceiling for any single backoff delay.
    pub max_delay: Duration,
    /// Wall-clock bound on the whole retry sequence.
    pub deadline: Duration,
    /// Bound on each individual request.
    pub request_timeout: Duration,
}

/// Runtime configuration for the summarization pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider preferred for every call that fits its context window.
    pub primary: ProviderSettings,
    /// Larger-context provider used when inputs exceed the primary window.
    pub fallback: Option<ProviderSettings>,
    /// Chunking and merge budgets.
    pub budget: BudgetSettings,
    /// Generation parameters.
    pub generation: GenerationSettings,
    /// Retry policy inputs.
    pub retry: RetrySettings,
    /// Tokens subtracted from a provider window before it is considered a fit.
    pub selector_safety_margin_tokens: usize,
    /// Characters per token assumed when exact counting is unavailable.
    pub chars_per_token: f64,
    /// Optional `tiktoken` encoding used instead of the character ratio.
    pub token_fallback_encoding: Option<String>,
    /// Maximum chunk calls in flight for one document.
    pub chunk_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables (after reading `.env`), then validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let primary_kind = load_provider_kind("PRIMARY")?.unwrap_or(ProviderKind::Anthropic);
        let primary = load_provider("PRIMARY", primary_kind)?;
        let fallback = load_provider_kind("FALLBACK")?
            .map(|kind| load_provider("FALLBACK", kind))
            .transpose()?;

        let config = Self {
            primary,
            fallback,
            budget: BudgetSettings {
                max_chunk_tokens: parse_or("MAX_CHUNK_TOKENS", 60_000)?,
                reserved_tokens: parse_or("RESERVED_TOKENS", 5_000)?,
                overlap_tokens: parse_or("OVERLAP_TOKENS", 1_000)?,
                merge_threshold_tokens: parse_or("MERGE_THRESHOLD_TOKENS", 120_000)?,
                max_overlap_paragraphs: parse_or("MAX_OVERLAP_PARAGRAPHS", 5)?,
                probe_batch: parse_or("CHUNK_PROBE_BATCH", 8)?,
            },
            generation: GenerationSettings {
                max_output_tokens: parse_or("MAX_OUTPUT_TOKENS", 32_000)?,
                temperature: parse_or("TEMPERATURE", 0.1)?,
                thinking_budget_tokens: parse_optional("THINKING_BUDGET_TOKENS")?,
            },
            retry: RetrySettings {
                max_retries: parse_or("MAX_RETRIES", 3)?,
                initial_delay: Duration::from_millis(parse_or("RETRY_INITIAL_DELAY_MS", 1_000)?),
                max_delay: Duration::from_millis(parse_or("RETRY_MAX_DELAY_MS", 60_000)?),
                deadline: Duration::from_secs(parse_or("RETRY_DEADLINE_SECS", 900)?),
                request_timeout: Duration::from_secs(parse_or("REQUEST_TIMEOUT_SECS", 300)?),
            },
            selector_safety_margin_tokens: parse_or("SELECTOR_SAFETY_MARGIN_TOKENS", 10_000)?,
            chars_per_token: parse_or("CHARS_PER_TOKEN", 4.0)?,
            token_fallback_encoding: load_env_optional("TOKEN_FALLBACK_ENCODING"),
            chunk_concurrency: parse_or("CHUNK_CONCURRENCY", 1)?,
        };

        config.validate()?;
        tracing::debug!(
            primary = %config.primary.kind,
            primary_model = %config.primary.model,
            fallback = ?config.fallback.as_ref().map(|settings| settings.kind),
            max_chunk_tokens = config.budget.max_chunk_tokens,
            merge_threshold_tokens = config.budget.merge_threshold_tokens,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Reject structurally impossible settings before any provider call is made.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.reserved_tokens >= self.budget.max_chunk_tokens {
            return Err(ConfigError::Inconsistent(format!(
                "RESERVED_TOKENS ({}) must be smaller than MAX_CHUNK_TOKENS ({})",
                self.budget.reserved_tokens, self.budget.max_chunk_tokens
            )));
        }
        if let Some(thinking) = self.generation.thinking_budget_tokens {
            if thinking >= self.generation.max_output_tokens {
                return Err(ConfigError::Inconsistent(format!(
                    "THINKING_BUDGET_TOKENS ({thinking}) must be smaller than MAX_OUTPUT_TOKENS ({})",
                    self.generation.max_output_tokens
                )));
            }
        }
        if self.chunk_concurrency == 0 {
            return Err(ConfigError::InvalidValue("CHUNK_CONCURRENCY".into()));
        }
        if self.budget.probe_batch == 0 {
            return Err(ConfigError::InvalidValue("CHUNK_PROBE_BATCH".into()));
        }
        if !(self.chars_per_token.is_finite() && self.chars_per_token > 0.0) {
            return Err(ConfigError::InvalidValue("CHARS_PER_TOKEN".into()));
        }
        Ok(())
    }
}

fn load_provider_kind(prefix: &str) -> Result<Option<ProviderKind>, ConfigError> {
    let key = format!("{prefix}_PROVIDER");
    load_env_optional(&key)
        .map(|value| {
            value
                .parse::<ProviderKind>()
                .map_err(|()| ConfigError::InvalidValue(key.clone()))
        })
        .transpose()
}

fn load_provider(prefix: &str, kind: ProviderKind) -> Result<ProviderSettings, ConfigError> {
    let model = load_env_optional(&format!("{prefix}_MODEL"))
        .unwrap_or_else(|| kind.default_model().to_string());
    let api_key = load_env_optional(&format!("{prefix}_API_KEY"))
        .or_else(|| load_env_optional(kind.api_key_variable()));
    let base_url = load_env_optional(&format!("{prefix}_BASE_URL"));
    let context_window_tokens = parse_optional(&format!("{prefix}_CONTEXT_WINDOW"))?
        .unwrap_or_else(|| kind.default_context_window());

    Ok(ProviderSettings {
        kind,
        model,
        api_key,
        base_url,
        context_window_tokens,
    })
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_optional<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    Ok(parse_optional(key)?.unwrap_or(default))
}
