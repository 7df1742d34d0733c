//! Provider Configuration
//!
//! Defines the configuration schema for upstream providers and their key pools.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for a single upstream provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL for the API
    pub base_url: String,

    /// Whether the provider is registered at startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Environment variable name for the API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Optional list of environment variables for multiple keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_keys_env: Option<Vec<String>>,

    /// Optional environment variable for custom base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_env: Option<String>,

    /// Models known to be served even before the catalog is fetched
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Parameter name mappings (e.g., max_completion_tokens -> max_tokens)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub param_mappings: HashMap<String, String>,

    /// Additional headers to send with requests
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Default per-key limits for this provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_true() -> bool {
    true
}

/// Per-key quota numbers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum calls per wall-clock minute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,

    /// Maximum calls per UTC day
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_quota: Option<u32>,
}

/// Key pool configuration for multi-key support
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyPoolConfig {
    /// List of environment variable names containing API keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys_env: Vec<String>,

    /// List of raw API keys (alternative to keys_env)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,

    /// Rotation strategy
    #[serde(default)]
    pub rotation_strategy: RotationStrategy,

    /// Overrides the provider's per-minute limit for every key in the pool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,

    /// Overrides the provider's daily quota for every key in the pool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_quota: Option<u32>,
}

/// Strategy for choosing where a key scan starts
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Start after the last successfully used key
    #[default]
    RoundRobin,

    /// Stay on the last successfully used key until it becomes unusable
    Sticky,
}

impl ProviderConfig {
    /// `api_base_env` when set in the environment, otherwise `base_url`
    pub fn get_base_url(&self) -> String {
        self.api_base_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_else(|| self.base_url.clone())
    }

    /// Keys from `api_key_env` then `api_keys_env`; unset, blank and repeated ones are skipped
    pub fn get_api_keys(&self) -> Vec<String> {
        let vars = self
            .api_key_env
            .iter()
            .chain(self.api_keys_env.iter().flatten());

        let mut keys: Vec<String> = Vec::new();
        for key in vars.filter_map(|var| std::env::var(var).ok()) {
            if !key.trim().is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

impl KeyPoolConfig {
    /// Keys listed directly or through environment variables, in config order
    pub fn resolve_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for env in &self.keys_env {
            if let Ok(key) = std::env::var(env) {
                keys.push(key);
            }
        }
        keys.extend(self.keys.iter().cloned());
        keys.retain(|k| !k.trim().is_empty());
        keys
    }
}
