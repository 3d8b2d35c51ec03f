//! Holds the configured providers for one pipeline run.

use super::{ProviderCapability, build_provider};
use crate::config::{Config, ConfigError};
use std::fmt;
use std::sync::Arc;

/// Closed set of provider roles used by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderRole {
    /// Preferred provider for inputs that fit its window.
    Primary,
    /// Larger-context provider for oversized inputs.
    Fallback,
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Primary plus optional fallback provider.
#[derive(Clone)]
pub struct ProviderRegistry {
    primary: Arc<dyn ProviderCapability>,
    fallback: Option<Arc<dyn ProviderCapability>>,
}

impl ProviderRegistry {
    /// Assemble a registry from already constructed providers.
    pub fn new(
        primary: Arc<dyn ProviderCapability>,
        fallback: Option<Arc<dyn ProviderCapability>>,
    ) -> Self {
        Self { primary, fallback }
    }

    /// Build every configured provider.
    ///
    /// A configured fallback that fails to initialize is an error, not a silent downgrade.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let timeout = config.retry.request_timeout;
        let primary = build_provider(ProviderRole::Primary, &config.primary, timeout)?;
        let fallback = config
            .fallback
            .as_ref()
            .map(|settings| build_provider(ProviderRole::Fallback, settings, timeout))
            .transpose()?;
        Ok(Self::new(primary, fallback))
    }

    /// Preferred provider.
    pub fn primary(&self) -> &Arc<dyn ProviderCapability> {
        &self.primary
    }

    /// Fallback provider, when configured.
    pub fn fallback(&self) -> Option<&Arc<dyn ProviderCapability>> {
        self.fallback.as_ref()
    }

    /// Provider filling `role`, if any.
    pub fn get(&self, role: ProviderRole) -> Option<&Arc<dyn ProviderCapability>> {
        match role {
            ProviderRole::Primary => Some(&self.primary),
            ProviderRole::Fallback => self.fallback.as_ref(),
        }
    }

    /// Look a provider up by its name, reporting which role it fills.
    pub fn resolve(&self, name: &str) -> Option<(ProviderRole, &Arc<dyn ProviderCapability>)> {
        if self.primary.name().eq_ignore_ascii_case(name) {
            return Some((ProviderRole::Primary, &self.primary));
        }
        self.fallback
            .as_ref()
            .filter(|provider| provider.name().eq_ignore_ascii_case(name))
            .map(|provider| (ProviderRole::Fallback, provider))
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("primary", &self.primary.name())
            .field(
                "fallback",
                &self.fallback.as_ref().map(|provider| provider.name()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, ProviderSettings, tests::sample_config};
    use crate::provider::testing::StaticProvider;

    #[test]
    fn resolve_finds_roles_by_name() {
        let registry = ProviderRegistry::new(
            Arc::new(StaticProvider::new("primary-model", 100)),
            Some(Arc::new(StaticProvider::new("big-model", 1_000))),
        );

        let (role, provider) = registry.resolve("BIG-MODEL").expect("fallback resolves");
        assert_eq!(role, ProviderRole::Fallback);
        assert_eq!(provider.context_window_tokens(), 1_000);
        assert_eq!(
            registry.resolve("primary-model").map(|(role, _)| role),
            Some(ProviderRole::Primary)
        );
        assert!(registry.resolve("unknown").is_none());
    }

    #[test]
    fn get_fallback_is_none_when_unconfigured() {
        let registry = ProviderRegistry::new(Arc::new(StaticProvider::new("only", 10)), None);
        assert!(registry.get(ProviderRole::Fallback).is_none());
        assert_eq!(registry.get(ProviderRole::Primary).map(|p| p.name()), Some("only"));
    }

    #[test]
    fn from_config_fails_when_fallback_cannot_initialize() {
        let mut config = sample_config();
        config.fallback = Some(ProviderSettings {
            kind: ProviderKind::Gemini,
            model: "gemini-test".into(),
            api_key: None,
            base_url: None,
            context_window_tokens: 1_000_000,
        });
        let error = ProviderRegistry::from_config(&config).expect_err("fallback has no key");
        assert!(matches!(error, ConfigError::ProviderInit { name, .. } if name == "gemini"));
    }

    #[test]
    fn from_config_builds_primary_and_fallback() {
        let mut config = sample_config();
        config.fallback = Some(ProviderSettings {
            kind: ProviderKind::Gemini,
            model: "gemini-test".into(),
            api_key: Some("g".into()),
            base_url: None,
            context_window_tokens: 1_000_000,
        });
        let registry = ProviderRegistry::from_config(&config).expect("registry");
        assert_eq!(registry.primary().name(), "anthropic");
        assert_eq!(registry.fallback().map(|p| p.name()), Some("gemini"));
    }
}
