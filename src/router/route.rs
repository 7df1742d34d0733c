//! Model Routing
//!
//! Handles parsing and routing of model identifiers.

use std::fmt;

/// Model identifier resolved to a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoute {
    /// Provider name (e.g., "openai", "gemini")
    pub provider: String,

    /// Model id as the provider knows it (may itself contain '/')
    pub model: String,
}

/// How a route was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// Exact id in a cached catalog
    Catalog,
    /// Explicit `provider/model`
    Prefix,
    /// A provider's configured model list
    Configured,
}

impl ModelRoute {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Split `provider/model` when the prefix names a known provider.
    ///
    /// `meta-llama/llama-3` is left alone unless `meta-llama` is registered.
    pub fn parse_prefixed(model_string: &str, is_provider: impl Fn(&str) -> bool) -> Option<Self> {
        let (provider, model) = model_string.split_once('/')?;
        if provider.is_empty() || model.is_empty() || !is_provider(provider) {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl fmt::Display for ModelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(name: &str) -> bool {
        matches!(name, "openai" | "openrouter")
    }

    #[test]
    fn test_parse_known_prefix() {
        let route = ModelRoute::parse_prefixed("openai/gpt-4", known).unwrap();
        assert_eq!(route, ModelRoute::new("openai", "gpt-4"));
    }

    #[test]
    fn test_model_keeps_inner_slashes() {
        let route = ModelRoute::parse_prefixed("openrouter/meta-llama/llama-3-70b", known).unwrap();
        assert_eq!(route.provider, "openrouter");
        assert_eq!(route.model, "meta-llama/llama-3-70b");
    }

    #[test]
    fn test_parse_rejects_unknown_or_bare() {
        assert!(ModelRoute::parse_prefixed("gpt-4", known).is_none());
        assert!(ModelRoute::parse_prefixed("meta-llama/llama-3", known).is_none());
        assert!(ModelRoute::parse_prefixed("openai/", known).is_none());
    }

    #[test]
    fn test_display() {
        let route = ModelRoute::new("openai", "gpt-4");
        assert_eq!(format!("{}", route), "openai/gpt-4");
    }
}
