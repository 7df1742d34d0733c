//! Rotation Selector
//!
//! Holds one [`KeyPool`] per provider and routes acquire/report calls to it.

use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::router::key_pool::{
    KeyHandle, KeyLimits, KeyPool, KeyPoolStatus, Outcome, RotationPolicy,
};
use parking_lot::RwLock;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-key limits for `provider`: key pool overrides, then provider defaults
pub fn limits_for(config: &GatewayConfig, provider: &str) -> KeyLimits {
    let pool_config = config.key_pools.get(provider);
    let provider_limits = config
        .providers
        .get(provider)
        .and_then(|p| p.rate_limit.clone())
        .unwrap_or_default();

    KeyLimits {
        per_minute: pool_config
            .and_then(|p| p.rate_limit_per_minute)
            .or(provider_limits.requests_per_minute),
        per_day: pool_config
            .and_then(|p| p.daily_quota)
            .or(provider_limits.daily_quota),
    }
}

/// Keys for `provider`: `key_pools.<provider>` when it lists any, otherwise the
/// provider's own key env vars
pub fn configured_keys(config: &GatewayConfig, provider: &str) -> Vec<String> {
    let pooled = config
        .key_pools
        .get(provider)
        .map(|p| p.resolve_keys())
        .unwrap_or_default();
    if !pooled.is_empty() {
        return pooled;
    }
    config
        .providers
        .get(provider)
        .map(|p| p.get_api_keys())
        .unwrap_or_default()
}

/// Key pools for every registered provider
#[derive(Debug)]
pub struct KeyRing {
    pools: RwLock<HashMap<String, Arc<KeyPool>>>,
    clock: Arc<dyn Clock>,
}

impl KeyRing {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Build pools for every enabled provider.
    ///
    /// Keys come from `key_pools.<provider>` when it lists any, otherwise from
    /// the provider's own key env vars. Providers without keys get an empty
    /// pool so they still show up in status reports.
    pub fn from_config(config: &GatewayConfig, clock: Arc<dyn Clock>) -> Self {
        let ring = Self::new(clock);

        let enabled = config
            .providers
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, _)| name);

        for name in enabled {
            let pool_config = config.key_pools.get(name);
            let keys = configured_keys(config, name);

            let limits = limits_for(config, name);
            let strategy = pool_config
                .map(|p| p.rotation_strategy)
                .unwrap_or_default();

            if keys.is_empty() {
                tracing::debug!(provider = %name, "no API keys configured");
            }

            ring.register_keys(
                name,
                keys.into_iter()
                    .map(|k| (SecretString::from(k), limits))
                    .collect(),
                RotationPolicy::from_config(&config.rotation, strategy),
            );
        }

        ring
    }

    /// Create (or replace) the pool of a provider
    pub fn register_keys(
        &self,
        provider: &str,
        keys: Vec<(SecretString, KeyLimits)>,
        policy: RotationPolicy,
    ) -> Arc<KeyPool> {
        let pool = Arc::new(KeyPool::new(provider, keys, policy, Arc::clone(&self.clock)));
        self.pools
            .write()
            .insert(provider.to_string(), Arc::clone(&pool));
        pool
    }

    pub fn pool(&self, provider: &str) -> Option<Arc<KeyPool>> {
        self.pools.read().get(provider).cloned()
    }

    fn require(&self, provider: &str) -> Result<Arc<KeyPool>> {
        self.pool(provider)
            .ok_or_else(|| GatewayError::ProviderNotFound(provider.to_string()))
    }

    /// Check out a usable key of `provider`
    pub fn acquire(&self, provider: &str) -> Result<KeyHandle> {
        self.require(provider)?.acquire()
    }

    /// Check out a usable key, skipping the named ones
    pub fn acquire_excluding(&self, provider: &str, tried: &[String]) -> Result<KeyHandle> {
        self.require(provider)?.acquire_excluding(tried)
    }

    /// Hand a key back to its pool
    pub fn report(&self, handle: KeyHandle, outcome: &Outcome) {
        match self.pool(handle.provider()) {
            Some(pool) => pool.report(handle, outcome),
            None => {
                tracing::warn!(provider = %handle.provider(), "report for unknown provider");
            }
        }
    }

    /// Clear expired timers across all pools
    pub fn sweep(&self) -> usize {
        let pools: Vec<Arc<KeyPool>> = self.pools.read().values().cloned().collect();
        pools.iter().map(|pool| pool.sweep()).sum()
    }

    /// Status of every pool, ordered by provider name
    pub fn statuses(&self) -> Vec<KeyPoolStatus> {
        let pools: Vec<Arc<KeyPool>> = self.pools.read().values().cloned().collect();
        let mut statuses: Vec<KeyPoolStatus> = pools.iter().map(|pool| pool.status()).collect();
        statuses.sort_by(|a, b| a.provider.cmp(&b.provider));
        statuses
    }
}
