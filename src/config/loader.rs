//! Configuration Loader
//!
//! Handles loading and merging gateway configuration from multiple sources.

use crate::config::provider::{KeyPoolConfig, ProviderConfig};
use crate::config::settings::{
    CacheConfig, FilterConfig, GatewayConfig, LoggingConfig, RotationConfig, StatisticsConfig,
    StorageConfig,
};
use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// One configuration source. Sections left out do not touch earlier layers.
#[derive(Debug, Default, Deserialize)]
struct ConfigLayer {
    #[serde(default)]
    providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    key_pools: HashMap<String, KeyPoolConfig>,
    rotation: Option<RotationConfig>,
    models_cache: Option<CacheConfig>,
    model_filters: Option<BTreeMap<String, FilterConfig>>,
    statistics: Option<StatisticsConfig>,
    storage: Option<StorageConfig>,
    logging: Option<LoggingConfig>,
    request_timeout_secs: Option<u64>,
}

/// Configuration loader with support for multiple sources
pub struct ConfigLoader {
    config: GatewayConfig,
    sources: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader and load from default locations
    pub fn new() -> Result<Self> {
        let mut loader = Self::empty();

        // Load built-in defaults first
        loader.load_builtin_defaults()?;

        // Then load from file system (can override built-ins)
        loader.load_from_default_paths()?;

        Ok(loader)
    }

    /// Create a loader with a specific config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut loader = Self::empty();

        loader.load_builtin_defaults()?;
        loader.load_from_file(path)?;

        Ok(loader)
    }

    fn empty() -> Self {
        Self {
            config: GatewayConfig::default(),
            sources: Vec::new(),
        }
    }

    /// Load built-in provider defaults
    fn load_builtin_defaults(&mut self) -> Result<()> {
        let defaults = include_str!("../../providers.json");
        let layer: ConfigLayer = serde_json::from_str(defaults).map_err(|e| {
            GatewayError::Config(format!("Failed to parse built-in providers.json: {}", e))
        })?;

        self.merge_layer(layer);
        Ok(())
    }

    /// Load configuration from default paths
    fn load_from_default_paths(&mut self) -> Result<()> {
        for path in Self::get_config_paths() {
            if path.exists() {
                self.load_from_file(&path)?;
            }
        }

        Ok(())
    }

    /// Get list of config paths to check, lowest precedence first
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".llmgate").join("config.json"));
        }

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("llmgate").join("config.json"));
        }

        paths.push(PathBuf::from("llmgate.json"));

        if let Ok(custom_path) = std::env::var("LLMGATE_CONFIG") {
            paths.push(PathBuf::from(custom_path));
        }

        paths
    }

    /// Load configuration from a specific file
    fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let layer: ConfigLayer = serde_json::from_str(&content).map_err(|e| {
            GatewayError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        tracing::debug!(path = %path.display(), "loaded config layer");
        self.sources.push(path.to_path_buf());
        self.merge_layer(layer);
        Ok(())
    }

    /// Merge another layer into this one (later layers override earlier)
    fn merge_layer(&mut self, layer: ConfigLayer) {
        self.config.providers.extend(layer.providers);
        self.config.key_pools.extend(layer.key_pools);

        if let Some(rotation) = layer.rotation {
            self.config.rotation = rotation;
        }
        if let Some(cache) = layer.models_cache {
            self.config.models_cache = cache;
        }
        if let Some(filters) = layer.model_filters {
            self.config.model_filters = filters;
        }
        if let Some(statistics) = layer.statistics {
            self.config.statistics = statistics;
        }
        if let Some(storage) = layer.storage {
            self.config.storage = storage;
        }
        if let Some(logging) = layer.logging {
            self.config.logging = logging;
        }
        if let Some(timeout) = layer.request_timeout_secs {
            self.config.request_timeout_secs = timeout;
        }
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Files that contributed to the configuration, in load order
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Take ownership of the configuration
    pub fn into_config(self) -> GatewayConfig {
        self.config
    }
}
