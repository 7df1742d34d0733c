//! Gateway Settings
//!
//! Root configuration and the gateway-wide sections: rotation thresholds,
//! catalog cache policy, category rules, statistics and storage.

use crate::config::provider::{KeyPoolConfig, ProviderConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Provider configurations keyed by provider name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Optional key pool configurations keyed by provider name
    #[serde(default)]
    pub key_pools: HashMap<String, KeyPoolConfig>,

    #[serde(default)]
    pub rotation: RotationConfig,

    #[serde(default)]
    pub models_cache: CacheConfig,

    /// Category rules keyed by rule name
    #[serde(default)]
    pub model_filters: BTreeMap<String, FilterConfig>,

    #[serde(default)]
    pub statistics: StatisticsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upper bound on a single provider call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            key_pools: HashMap::new(),
            rotation: RotationConfig::default(),
            models_cache: CacheConfig::default(),
            model_filters: BTreeMap::new(),
            statistics: StatisticsConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Thresholds for the credential state machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RotationConfig {
    /// Consecutive auth/transient errors before a key is disabled
    #[serde(default = "default_max_errors")]
    pub max_errors_before_disable: u32,

    /// How long a disabled key sits out before one probe attempt
    #[serde(default = "default_retry_hours")]
    pub retry_blocked_key_after_hours: u32,

    /// Interval of the background sweep that clears expired timers
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_errors() -> u32 {
    5
}

fn default_retry_hours() -> u32 {
    24
}

fn default_sweep_secs() -> u64 {
    30
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_errors_before_disable: default_max_errors(),
            retry_blocked_key_after_hours: default_retry_hours(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

/// Model catalog cache policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// When disabled, catalogs are neither loaded from nor written to storage
    #[serde(default = "enabled")]
    pub enabled: bool,

    #[serde(default = "default_update_hours")]
    pub update_interval_hours: u64,

    /// Refresh every provider once at startup instead of trusting persisted catalogs
    #[serde(default)]
    pub refresh_on_startup: bool,
}

fn default_update_hours() -> u64 {
    24
}

fn enabled() -> bool {
    true
}

impl CacheConfig {
    pub fn update_interval(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::hours(self.update_interval_hours.max(1) as i64)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval_hours: default_update_hours(),
            refresh_on_startup: false,
        }
    }
}

/// One category rule
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterConfig {
    /// Category tag assigned on match (defaults to the rule name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Case-insensitive substrings matched against model id and name
    #[serde(default)]
    pub keywords: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Usage statistics settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatisticsConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,

    /// Interval between batched writes of usage records
    #[serde(default = "default_flush_secs")]
    pub flush_interval_secs: u64,
}

fn default_flush_secs() -> u64 {
    60
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_secs: default_flush_secs(),
        }
    }
}

/// Durable storage location
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory for catalog snapshots and usage records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Configured directory, or the platform data directory
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("llmgate"))
            .unwrap_or_else(|| PathBuf::from("data"))
    }
}

/// Logging settings for the binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.rotation.max_errors_before_disable, 5);
        assert_eq!(config.rotation.retry_blocked_key_after_hours, 24);
        assert_eq!(config.models_cache.update_interval_hours, 24);
        assert!(config.models_cache.enabled);
        assert!(config.statistics.enabled);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_filter_rules_deserialize() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "model_filters": {
                    "images": { "category": "image_generation", "keywords": ["vision", "image"] }
                }
            }"#,
        )
        .unwrap();
        let rule = &config.model_filters["images"];
        assert_eq!(rule.category.as_deref(), Some("image_generation"));
        assert_eq!(rule.keywords, vec!["vision", "image"]);
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let storage = StorageConfig {
            data_dir: Some(PathBuf::from("/tmp/llmgate-data")),
        };
        assert_eq!(storage.resolve_data_dir(), PathBuf::from("/tmp/llmgate-data"));
    }
}
