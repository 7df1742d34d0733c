//! Client Module
//!
//! Provider client capability, registry and the OpenAI-compatible HTTP client.

pub mod classify;
pub mod http;
#[cfg(test)]
pub mod mock;
pub mod registry;

pub use http::OpenAiCompatibleClient;
pub use registry::ProviderRegistry;

use crate::api::{CompletionRequest, CompletionResponse};
use crate::catalog::ModelDescriptor;
use crate::error::{FetchError, ProviderError};
use async_trait::async_trait;
use secrecy::SecretString;
use std::fmt::Debug;

/// What the gateway needs from one upstream provider
#[async_trait]
pub trait ProviderClient: Send + Sync + Debug {
    /// Live model list
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, FetchError>;

    /// One completion call authenticated with `key`
    async fn complete(
        &self,
        key: &SecretString,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;
}
