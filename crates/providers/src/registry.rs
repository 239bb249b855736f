//! Single-provider registry.
//!
//! The teacher's registry juggled several concurrently-configured providers
//! with role-based routing (planner vs executor) and per-provider init
//! failure tracking. This gateway only ever runs one: Anthropic, selected by
//! `llm.provider` in config. The registry's job shrinks to "build it once,
//! hand out a shared handle, and say clearly why it's missing if the API key
//! isn't set."

use crate::anthropic::AnthropicProvider;
use crate::traits::LlmProvider;
use aegis_domain::config::LlmConfig;
use aegis_domain::error::{Error, Result};
use std::sync::Arc;

/// Holds the single configured LLM provider for the gateway's lifetime.
pub struct ProviderRegistry {
    provider: Option<Arc<dyn LlmProvider>>,
    init_error: Option<String>,
}

impl ProviderRegistry {
    /// Build the registry from config. Construction never fails outright —
    /// a missing API key is recorded as `init_error` so the gateway can
    /// start and serve health checks while reporting the provider as
    /// unavailable, rather than refusing to boot.
    pub fn from_config(cfg: &LlmConfig) -> Self {
        match cfg.provider.as_str() {
            "anthropic" => match AnthropicProvider::from_config(cfg) {
                Ok(p) => Self { provider: Some(Arc::new(p)), init_error: None },
                Err(e) => {
                    tracing::warn!(error = %e, "provider init failed");
                    Self { provider: None, init_error: Some(e.to_string()) }
                }
            },
            other => Self {
                provider: None,
                init_error: Some(format!("unsupported llm.provider: {other}")),
            },
        }
    }

    /// The active provider, or an error describing why none is available.
    pub fn get(&self) -> Result<Arc<dyn LlmProvider>> {
        self.provider.clone().ok_or_else(|| {
            Error::Provider {
                provider: "anthropic".into(),
                message: self.init_error.clone().unwrap_or_else(|| "not configured".into()),
            }
        })
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(api_key: Option<&str>) -> LlmConfig {
        LlmConfig {
            provider: "anthropic".into(),
            anthropic_api_key: api_key.map(|s| s.to_string()),
            model: "claude-sonnet-4-20250514".into(),
            anthropic_base_url: "https://api.anthropic.com".into(),
            planner_max_tokens: 1024,
            stream_max_tokens: 4096,
            request_timeout_ms: 30_000,
        }
    }

    #[test]
    fn missing_api_key_yields_unavailable_registry() {
        let reg = ProviderRegistry::from_config(&cfg(None));
        assert!(!reg.is_available());
        assert!(reg.get().is_err());
    }

    #[test]
    fn configured_key_yields_available_registry() {
        let reg = ProviderRegistry::from_config(&cfg(Some("sk-test")));
        assert!(reg.is_available());
        assert!(reg.get().is_ok());
    }

    #[test]
    fn unsupported_provider_name_is_recorded() {
        let mut c = cfg(Some("sk-test"));
        c.provider = "openai".into();
        let reg = ProviderRegistry::from_config(&c);
        assert!(!reg.is_available());
    }
}
