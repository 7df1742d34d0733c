//! Configuration Module
//!
//! Handles gateway configuration loading and validation.

pub mod loader;
pub mod provider;
pub mod settings;

pub use loader::ConfigLoader;
pub use provider::{KeyPoolConfig, ProviderConfig, RateLimitConfig, RotationStrategy};
pub use settings::{
    CacheConfig, FilterConfig, GatewayConfig, LoggingConfig, RotationConfig, StatisticsConfig,
    StorageConfig,
};
