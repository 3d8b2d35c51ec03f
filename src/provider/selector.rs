//! Chooses the primary or fallback provider for a given input size.

use super::{ProviderCapability, ProviderRegistry, ProviderRole};
use std::sync::Arc;

/// Outcome of a provider selection.
#[derive(Clone)]
pub struct Selection {
    /// Role of the chosen provider.
    pub role: ProviderRole,
    /// Chosen provider.
    pub provider: Arc<dyn ProviderCapability>,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("role", &self.role)
            .field("provider", &self.provider.name())
            .finish()
    }
}

/// Token-budget based provider selection.
///
/// Selection happens independently for the single-shot path, for each chunk and for the merge
/// step; the selector holds no state between calls.
#[derive(Debug, Clone, Copy)]
pub struct ProviderSelector {
    safety_margin_tokens: usize,
}

impl ProviderSelector {
    /// Create a selector that keeps `safety_margin_tokens` free in the preferred window.
    pub fn new(safety_margin_tokens: usize) -> Self {
        Self {
            safety_margin_tokens,
        }
    }

    /// Whether `estimated_tokens` fits in `provider` after the safety margin.
    pub fn fits(&self, provider: &dyn ProviderCapability, estimated_tokens: usize) -> bool {
        estimated_tokens
            <= provider
                .context_window_tokens()
                .saturating_sub(self.safety_margin_tokens)
    }

    /// Pick the primary provider when the input fits, otherwise the fallback.
    ///
    /// Without a fallback the primary is returned anyway and downstream token-limit errors
    /// surface from the provider itself.
    pub fn select(&self, estimated_tokens: usize, registry: &ProviderRegistry) -> Selection {
        let primary = registry.primary();
        if self.fits(primary.as_ref(), estimated_tokens) {
            return Selection {
                role: ProviderRole::Primary,
                provider: Arc::clone(primary),
            };
        }

        match registry.fallback() {
            Some(fallback) => {
                tracing::info!(
                    estimated_tokens,
                    primary = primary.name(),
                    primary_window = primary.context_window_tokens(),
                    fallback = fallback.name(),
                    "Input exceeds preferred provider window; using fallback"
                );
                Selection {
                    role: ProviderRole::Fallback,
                    provider: Arc::clone(fallback),
                }
            }
            None => {
                tracing::warn!(
                    estimated_tokens,
                    primary = primary.name(),
                    primary_window = primary.context_window_tokens(),
                    "Input exceeds preferred provider window and no fallback is configured"
                );
                Selection {
                    role: ProviderRole::Primary,
                    provider: Arc::clone(primary),
                }
            }
        }
    }
}
