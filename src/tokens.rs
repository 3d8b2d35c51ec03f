//! Token estimation with provider-exact counts and a local fallback.
//!
//! Exact counts come from the provider's counting endpoint and are cached per
//! `(provider, sha256(content))` for the lifetime of one estimator. When counting fails or is
//! unsupported the estimate falls back to a `tiktoken` encoding (if configured) or a fixed
//! characters-per-token ratio, and the result is flagged as approximate.

use crate::config::{Config, ConfigError};
use crate::provider::{Message, ProviderCapability, ProviderError, TokenCountInput, call_with_timeout};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base, p50k_base, r50k_base};

/// Per-message scaffolding tokens added by the approximate counter.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Result of a token estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCount {
    /// Estimated token count.
    pub tokens: usize,
    /// `true` when the provider could not count and a local heuristic was used.
    pub approximate: bool,
}

impl TokenCount {
    fn exact(tokens: usize) -> Self {
        Self {
            tokens,
            approximate: false,
        }
    }

    fn approximate(tokens: usize) -> Self {
        Self {
            tokens,
            approximate: true,
        }
    }
}

type CacheKey = (String, String);

/// Converts text or message lists into token counts for a given provider.
pub struct TokenEstimator {
    chars_per_token: f64,
    encoding: Option<Arc<CoreBPE>>,
    request_timeout: Duration,
    cache: RwLock<HashMap<CacheKey, usize>>,
    unsupported: RwLock<HashSet<String>>,
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("chars_per_token", &self.chars_per_token)
            .field("encoding", &self.encoding.is_some())
            .field("cached", &self.cached_entries())
            .finish()
    }
}

impl TokenEstimator {
    /// Estimator falling back to `chars_per_token` characters per token.
    pub fn new(chars_per_token: f64, request_timeout: Duration) -> Self {
        Self {
            chars_per_token,
            encoding: None,
            request_timeout,
            cache: RwLock::new(HashMap::new()),
            unsupported: RwLock::new(HashSet::new()),
        }
    }

    /// Build from configuration, loading the optional `tiktoken` encoding.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let estimator = Self::new(config.chars_per_token, config.retry.request_timeout);
        match config.token_fallback_encoding.as_deref() {
            Some(name) => estimator.with_encoding(name),
            None => Ok(estimator),
        }
    }

    /// Use the named `tiktoken` encoding instead of the character ratio for fallbacks.
    pub fn with_encoding(mut self, name: &str) -> Result<Self, ConfigError> {
        let encoding = encoding_from_name(name.trim())
            .ok_or_else(|| ConfigError::InvalidValue("TOKEN_FALLBACK_ENCODING".into()))?
            .map_err(|error| {
                ConfigError::Inconsistent(format!(
                    "failed to load tokenizer encoding '{name}': {error}"
                ))
            })?;
        self.encoding = Some(Arc::new(encoding));
        Ok(self)
    }

    /// Estimate tokens for plain text as seen by `provider`.
    pub async fn estimate(&self, provider: &dyn ProviderCapability, text: &str) -> TokenCount {
        if text.is_empty() {
            return TokenCount::exact(0);
        }
        let digest = content_digest([text]);
        self.count(provider, TokenCountInput::Text(text), digest, || {
            self.approximate_text(text)
        })
        .await
    }

    /// Estimate tokens for a structured message list.
    pub async fn estimate_messages(
        &self,
        provider: &dyn ProviderCapability,
        messages: &[Message],
    ) -> TokenCount {
        if messages.is_empty() {
            return TokenCount::exact(0);
        }
        let digest = content_digest(
            messages
                .iter()
                .flat_map(|message| [message.role.as_str(), message.content.as_str()]),
        );
        self.count(provider, TokenCountInput::Messages(messages), digest, || {
            messages
                .iter()
                .map(|message| self.approximate_text(&message.content) + MESSAGE_OVERHEAD_TOKENS)
                .sum()
        })
        .await
    }

    /// Local heuristic estimate; never touches the network.
    pub fn approximate_text(&self, text: &str) -> usize {
        match &self.encoding {
            Some(encoding) => encoding.encode_ordinary(text).len(),
            None => (text.chars().count() as f64 / self.chars_per_token).ceil() as usize,
        }
    }

    /// Number of exact counts currently cached.
    pub fn cached_entries(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn count<F>(
        &self,
        provider: &dyn ProviderCapability,
        input: TokenCountInput<'_>,
        digest: String,
        fallback: F,
    ) -> TokenCount
    where
        F: FnOnce() -> usize,
    {
        let key = (provider.name().to_string(), digest);
        let cached = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied();
        if let Some(tokens) = cached {
            return TokenCount::exact(tokens);
        }

        let unsupported = self
            .unsupported
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key.0);
        if unsupported {
            return TokenCount::approximate(fallback());
        }

        match call_with_timeout(self.request_timeout, provider.count_tokens(input)).await {
            Ok(tokens) => {
                self.cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, tokens);
                TokenCount::exact(tokens)
            }
            Err(ProviderError::Unsupported(capability)) => {
                tracing::debug!(
                    provider = %key.0,
                    capability,
                    "Provider cannot count tokens; using local estimates"
                );
                self.unsupported
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.0);
                TokenCount::approximate(fallback())
            }
            Err(error) => {
                let tokens = fallback();
                tracing::warn!(
                    provider = %key.0,
                    error = %error,
                    approximate_tokens = tokens,
                    "Token count failed; using approximate estimate"
                );
                TokenCount::approximate(tokens)
            }
        }
    }
}

fn content_digest<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn encoding_from_name(name: &str) -> Option<anyhow::Result<CoreBPE>> {
    match name {
        "cl100k_base" => Some(cl100k_base()),
        "o200k_base" => Some(o200k_base()),
        "p50k_base" => Some(p50k_base()),
        "r50k_base" | "gpt2" => Some(r50k_base()),
        _ => None,
    }
}
