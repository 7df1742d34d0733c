//! HTTP Client
//!
//! OpenAI-compatible provider client: `GET /models` for the catalog and
//! `POST /chat/completions` for calls.

use crate::api::{CompletionRequest, CompletionResponse};
use crate::catalog::ModelDescriptor;
use crate::client::classify::classify_response;
use crate::client::ProviderClient;
use crate::config::ProviderConfig;
use crate::error::{FetchError, GatewayError, ProviderError, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// `GET /models` response body
#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

/// One listed model; OpenRouter-style extras are optional
#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    context_length: Option<u32>,
}

impl From<ModelEntry> for ModelDescriptor {
    fn from(entry: ModelEntry) -> Self {
        let mut model = ModelDescriptor::new(entry.id);
        if let Some(name) = entry.name.filter(|n| !n.is_empty()) {
            model.name = name;
        }
        if let Some(description) = entry.description {
            model.description = description;
        }
        model.context_length = entry.context_length;
        model
    }
}

/// Client for any provider speaking the OpenAI REST dialect
#[derive(Debug)]
pub struct OpenAiCompatibleClient {
    name: String,
    base_url: String,
    client: Client,
    headers: HeaderMap,
    param_mappings: HashMap<String, String>,
    /// Key used only for catalog listing
    listing_key: Option<SecretString>,
    /// Total time budget for retrying a catalog fetch
    fetch_retry_budget: Duration,
}

impl OpenAiCompatibleClient {
    /// Create a client for `name` from its provider config
    pub fn from_config(name: &str, config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (key, value) in &config.headers {
            let name = HeaderName::try_from(key.as_str()).map_err(|e| {
                GatewayError::Config(format!("Invalid header name '{}': {}", key, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                GatewayError::Config(format!("Invalid value for header '{}': {}", key, e))
            })?;
            headers.insert(name, value);
        }

        Ok(Self {
            name: name.to_string(),
            base_url: config.get_base_url().trim_end_matches('/').to_string(),
            client,
            headers,
            param_mappings: config.param_mappings.clone(),
            listing_key: config.get_api_keys().into_iter().next().map(SecretString::from),
            fetch_retry_budget: Duration::from_secs(30),
        })
    }

    pub fn with_listing_key(mut self, key: Option<SecretString>) -> Self {
        self.listing_key = key;
        self
    }

    pub fn with_fetch_retry_budget(mut self, budget: Duration) -> Self {
        self.fetch_retry_budget = budget;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn bearer(key: &SecretString) -> std::result::Result<HeaderValue, ProviderError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
            .map_err(|e| ProviderError::Auth(format!("Invalid API key format: {}", e)))?;
        value.set_sensitive(true);
        Ok(value)
    }

    async fn fetch_models_once(&self) -> std::result::Result<Vec<ModelDescriptor>, ProviderError> {
        let mut request = self.client.get(self.url("models")).headers(self.headers.clone());
        if let Some(key) = &self.listing_key {
            request = request.header(AUTHORIZATION, Self::bearer(key)?);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status.as_u16(), &headers, &body));
        }

        let list: ModelList = response.json().await?;
        Ok(list.data.into_iter().map(ModelDescriptor::from).collect())
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            max_elapsed_time: Some(self.fetch_retry_budget),
            max_interval: Duration::from_secs(10),
            initial_interval: Duration::from_millis(250),
            multiplier: 2.0,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    async fn list_models(&self) -> std::result::Result<Vec<ModelDescriptor>, FetchError> {
        let result = backoff::future::retry(self.backoff(), || async {
            self.fetch_models_once().await.map_err(|e| match e {
                ProviderError::Transient(_) | ProviderError::RateLimited { .. } => {
                    tracing::debug!(provider = %self.name, error = %e, "retrying model listing");
                    backoff::Error::transient(e)
                }
                _ => backoff::Error::permanent(e),
            })
        })
        .await;

        result.map_err(|e| FetchError::new(self.name.clone(), e.to_string()))
    }

    async fn complete(
        &self,
        key: &SecretString,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, ProviderError> {
        let mut body = serde_json::to_value(request).map_err(|e| {
            ProviderError::InvalidRequest(format!("Failed to encode request: {}", e))
        })?;
        if let Some(obj) = body.as_object_mut() {
            for (from, to) in &self.param_mappings {
                if let Some(value) = obj.remove(from) {
                    obj.insert(to.clone(), value);
                }
            }
        }

        let response = self
            .client
            .post(self.url("chat/completions"))
            .headers(self.headers.clone())
            .header(AUTHORIZATION, Self::bearer(key)?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let text = response.text().await?;
            return serde_json::from_str(&text).map_err(|e| {
                ProviderError::Transient(format!(
                    "Failed to parse response: {}. Body: {}",
                    e,
                    text.chars().take(300).collect::<String>()
                ))
            });
        }

        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        Err(classify_response(status.as_u16(), &headers, &text))
    }
}
