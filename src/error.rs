//! Gateway Error Types
//!
//! Error taxonomy for key rotation, catalog refresh and provider calls.

use thiserror::Error;

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration errors (invalid JSON, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider not registered with the gateway
    #[error("Provider '{0}' not found. Register it in the config under `providers`.")]
    ProviderNotFound(String),

    /// No provider serves the requested model
    #[error("Model '{0}' is not served by any registered provider")]
    ModelNotFound(String),

    /// No credential with that name in the provider's pool
    #[error("Key '{key}' not found for provider '{provider}'")]
    KeyNotFound { provider: String, key: String },

    /// Every credential of the provider is blocked, disabled or exhausted
    #[error("No API keys available for '{0}': every key is blocked, disabled or exhausted")]
    NoAvailableKey(String),

    /// Catalog refresh failed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A provider call failed and could not be recovered by rotating keys
    #[error("Provider '{provider}' call failed: {source}")]
    Upstream {
        provider: String,
        #[source]
        source: ProviderError,
    },

    /// Durable storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether callers should surface this as a service-unavailable condition
    pub fn is_unavailable(&self) -> bool {
        matches!(self, GatewayError::NoAvailableKey(_))
    }
}

/// Outcome errors of a single provider call.
///
/// Everything except `InvalidRequest` is attributed to the credential that
/// made the call and feeds its state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<u64> },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Transient(format!("timeout: {}", err))
        } else if err.is_connect() {
            ProviderError::Transient(format!("connection failed: {}", err))
        } else if err.is_decode() {
            ProviderError::Transient(format!("failed to decode response: {}", err))
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

fn retry_suffix(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(seconds) => format!(", retry after {}s", seconds),
        None => String::new(),
    }
}

/// Catalog fetch failure for one provider
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to fetch models from '{provider}': {message}")]
pub struct FetchError {
    pub provider: String,
    pub message: String,
}

impl FetchError {
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
