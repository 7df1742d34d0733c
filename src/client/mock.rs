//! Scripted provider client for tests

use crate::api::{Choice, CompletionRequest, CompletionResponse, Message, Usage};
use crate::catalog::ModelDescriptor;
use crate::client::ProviderClient;
use crate::error::{FetchError, ProviderError};
use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Tokens reported by every scripted success
pub const SCRIPTED_TOKENS: u32 = 10;

#[derive(Debug)]
pub struct ScriptedClient {
    name: String,
    models: Mutex<Result<Vec<ModelDescriptor>, String>>,
    list_delay: Mutex<Duration>,
    list_calls: AtomicUsize,
    scripts: Mutex<HashMap<String, VecDeque<Result<(), ProviderError>>>>,
    call_delay: Mutex<Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            models: Mutex::new(Ok(Vec::new())),
            list_delay: Mutex::new(Duration::ZERO),
            list_calls: AtomicUsize::new(0),
            scripts: Mutex::new(HashMap::new()),
            call_delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_models(self, ids: &[&str]) -> Self {
        self.set_models(ids);
        self
    }

    pub fn set_models(&self, ids: &[&str]) {
        *self.models.lock() = Ok(ids.iter().map(|id| ModelDescriptor::new(*id)).collect());
    }

    /// Make listing fail until models are set again
    pub fn fail_listing(&self, message: &str) {
        *self.models.lock() = Err(message.to_string());
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock() = delay;
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock() = delay;
    }

    /// Queue outcomes for calls made with `secret`; unscripted calls succeed
    pub fn script(&self, secret: &str, outcomes: Vec<Result<(), ProviderError>>) {
        self.scripts
            .lock()
            .entry(secret.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Secrets used by completion calls, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, FetchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.models
            .lock()
            .clone()
            .map_err(|message| FetchError::new(self.name.clone(), message))
    }

    async fn complete(
        &self,
        key: &SecretString,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let secret = key.expose_secret().to_string();
        self.calls.lock().push(secret.clone());

        let delay = *self.call_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .get_mut(&secret)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or(Ok(()))?;

        Ok(CompletionResponse {
            id: format!("{}-{}", self.name, self.calls.lock().len()),
            object: "chat.completion".to_string(),
            created: 0,
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::new("assistant", format!("answered with {}", secret)),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage {
                prompt_tokens: 4,
                completion_tokens: SCRIPTED_TOKENS - 4,
                total_tokens: SCRIPTED_TOKENS,
            }),
        })
    }
}
