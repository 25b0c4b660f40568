//! Provider routing
//!
//! Maps a request's model name to one configured upstream provider and
//! decides whether dialect translation is needed. Routing is by model-name
//! prefix: `gpt*` prefers the first OpenAI-dialect provider, `claude*` the
//! first Anthropic-dialect one, anything else falls back to the first
//! provider in the registry. Registry order is deterministic (name-sorted).

use crate::config::{Config, DialectHint};
use crate::providers::{
    anthropic::AnthropicProvider, build_http_client, openai::OpenAiProvider, Provider,
};
use crate::translation::{Dialect, TranslateMode};
use anyhow::Result;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("No provider available for model: {0}")]
    NoProviderForModel(String),
}

/// One routing decision
pub struct Route {
    pub provider_name: String,
    pub provider: Arc<dyn Provider>,
    pub mode: TranslateMode,
}

/// Configured providers, initialized once at startup and read-only after
pub struct ProviderRegistry {
    entries: Vec<(String, Arc<dyn Provider>)>,
}

impl ProviderRegistry {
    /// Build provider handles from configuration.
    ///
    /// All handles for the same gateway share one pooled HTTP client so
    /// upstream connections are reused across calls.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = build_http_client(&config.proxy, config.http.max_connections)?;

        let mut names: Vec<&String> = config.providers.keys().collect();
        names.sort();

        let mut entries: Vec<(String, Arc<dyn Provider>)> = Vec::new();
        for name in names {
            let settings = &config.providers[name];
            let handle: Arc<dyn Provider> = match settings.dialect {
                DialectHint::OpenAiCompatible => Arc::new(OpenAiProvider::new(
                    client.clone(),
                    settings.api_key.clone(),
                    settings.base_url.clone(),
                )),
                DialectHint::AnthropicCompatible => Arc::new(AnthropicProvider::new(
                    client.clone(),
                    settings.api_key.clone(),
                    settings.base_url.clone(),
                )),
            };
            tracing::info!(
                "Registered provider '{}' ({})",
                name,
                handle.dialect().name()
            );
            entries.push((name.clone(), handle));
        }

        Ok(Self { entries })
    }

    #[cfg(test)]
    pub fn from_entries(entries: Vec<(String, Arc<dyn Provider>)>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Provider names in registry order (for /v1/models and /health)
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Iterate (name, dialect) pairs
    pub fn dialects(&self) -> Vec<(String, Dialect)> {
        self.entries
            .iter()
            .map(|(n, p)| (n.clone(), p.dialect()))
            .collect()
    }

    fn first_with_dialect(&self, dialect: Dialect) -> Option<&(String, Arc<dyn Provider>)> {
        self.entries.iter().find(|(_, p)| p.dialect() == dialect)
    }

    /// Pick a provider for the model and decide the translation mode for the
    /// given client dialect.
    pub fn route(&self, model: &str, client_dialect: Dialect) -> Result<Route, RouteError> {
        let entry = if model.starts_with("gpt") {
            self.first_with_dialect(Dialect::OpenAi)
        } else if model.starts_with("claude") {
            self.first_with_dialect(Dialect::Anthropic)
        } else {
            None
        };

        let (name, provider) = entry
            .or_else(|| self.entries.first())
            .ok_or_else(|| RouteError::NoProviderForModel(model.to_string()))?;

        let mode = TranslateMode::for_dialects(client_dialect, provider.dialect());

        tracing::debug!(
            "Routed model '{}' to provider '{}' ({:?})",
            model,
            name,
            mode
        );

        Ok(Route {
            provider_name: name.clone(),
            provider: provider.clone(),
            mode,
        })
    }
}
