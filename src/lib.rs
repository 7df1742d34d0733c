//! llmgate - Multi-provider LLM gateway core
//!
//! Rotates API keys across per-key quotas, caches each provider's model
//! catalog and records usage, all behind one [`Gateway`] facade.

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub mod api;
pub mod catalog;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod router;
pub mod stats;
pub mod storage;

pub use api::{CompletionRequest, CompletionResponse, Message};
pub use error::{GatewayError, ProviderError, Result};

use catalog::{
    matches_query, CatalogInfo, CategoryFilter, CategoryInfo, ModelCache, ModelCatalog,
    ModelDescriptor,
};
use client::{OpenAiCompatibleClient, ProviderClient, ProviderRegistry};
use clock::{Clock, SystemClock};
use config::{ConfigLoader, GatewayConfig, RotationStrategy};
use router::rotation::{configured_keys, limits_for};
use router::{
    KeyHandle, KeyPool, KeyPoolStatus, KeyRing, ModelRoute, Outcome, RotationPolicy, RouteSource,
};
use secrecy::SecretString;
use stats::{UsageRecord, UsageSummary, UsageTracker};
use storage::{JsonFileStore, SnapshotStore};

/// A model together with the provider serving it
#[derive(Debug, Clone, Serialize)]
pub struct ProviderModel {
    pub provider: String,
    #[serde(flatten)]
    pub model: ModelDescriptor,
}

/// A category with the number of cached models carrying it
#[derive(Debug, Clone, Serialize)]
pub struct CategorySummary {
    #[serde(flatten)]
    pub info: CategoryInfo,
    pub model_count: usize,
}

/// Health of one provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub available: bool,
    pub keys: KeyPoolStatus,
    pub catalog: CatalogInfo,
}

/// Outcome of a forced catalog refresh
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// Model count per refreshed provider
    pub updated: BTreeMap<String, usize>,
    /// Error message per failed provider
    pub errors: BTreeMap<String, String>,
    pub total_models: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatisticsReport {
    pub summary: UsageSummary,
    pub records: Vec<UsageRecord>,
}

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SnapshotStore>>,
    persist: bool,
    clients: Vec<(String, Arc<dyn ProviderClient>)>,
}

impl GatewayBuilder {
    /// Time source for quota buckets and catalog ages
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Storage backend; defaults to JSON files under the configured data dir
    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self.persist = true;
        self
    }

    /// Keep catalogs and statistics in memory only
    pub fn without_storage(mut self) -> Self {
        self.store = None;
        self.persist = false;
        self
    }

    /// Use `client` for `name` instead of the configured HTTP client
    pub fn client(mut self, name: impl Into<String>, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.push((name.into(), client));
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let Self {
            config,
            clock,
            store,
            persist,
            mut clients,
        } = self;

        let registry = Arc::new(ProviderRegistry::new());
        let mut names: Vec<&String> = config
            .providers
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, _)| name)
            .collect();
        names.sort();

        for name in names {
            if let Some(pos) = clients.iter().position(|(n, _)| n == name) {
                let (name, client) = clients.remove(pos);
                registry.register(name, client);
            } else if let Some(provider) = config.providers.get(name) {
                let listing_key = configured_keys(&config, name)
                    .into_iter()
                    .next()
                    .map(SecretString::from);
                let client =
                    OpenAiCompatibleClient::from_config(name, provider, config.request_timeout())?
                        .with_listing_key(listing_key);
                registry.register(name.clone(), Arc::new(client));
            }
        }
        for (name, client) in clients {
            registry.register(name, client);
        }

        let keys = KeyRing::from_config(&config, Arc::clone(&clock));
        for name in registry.names() {
            if keys.pool(&name).is_none() {
                let limits = limits_for(&config, &name);
                let secrets = configured_keys(&config, &name)
                    .into_iter()
                    .map(|k| (SecretString::from(k), limits))
                    .collect();
                keys.register_keys(&name, secrets, policy_for(&config, &name));
            }
        }

        let store: Option<Arc<dyn SnapshotStore>> = if persist {
            Some(store.unwrap_or_else(|| {
                Arc::new(JsonFileStore::new(config.storage.resolve_data_dir()))
            }))
        } else {
            None
        };

        let cache = Arc::new(ModelCache::new(
            Arc::clone(&registry),
            CategoryFilter::from_config(&config.model_filters),
            config.models_cache.update_interval(),
            Arc::clone(&clock),
            store.clone().filter(|_| config.models_cache.enabled),
        ));

        let stats = if config.statistics.enabled {
            UsageTracker::new(Arc::clone(&clock), store)
        } else {
            UsageTracker::disabled(Arc::clone(&clock))
        };

        tracing::debug!(providers = registry.len(), "gateway built");

        Ok(Gateway {
            request_timeout: config.request_timeout(),
            config,
            registry,
            keys,
            cache,
            stats,
        })
    }
}

fn policy_for(config: &GatewayConfig, provider: &str) -> RotationPolicy {
    let strategy: RotationStrategy = config
        .key_pools
        .get(provider)
        .map(|p| p.rotation_strategy)
        .unwrap_or_default();
    RotationPolicy::from_config(&config.rotation, strategy)
}

/// Reports a checked-out key exactly once, even if the call future is dropped
struct CallGuard<'a> {
    pool: &'a KeyPool,
    stats: &'a UsageTracker,
    route: &'a ModelRoute,
    handle: Option<KeyHandle>,
    started: Instant,
}

impl CallGuard<'_> {
    fn key(&self) -> Option<&SecretString> {
        self.handle.as_ref().map(KeyHandle::secret)
    }

    fn finish(mut self, outcome: &Outcome, tokens: u64) {
        self.settle(outcome, tokens);
    }

    fn settle(&mut self, outcome: &Outcome, tokens: u64) {
        if let Some(handle) = self.handle.take() {
            self.pool.report(handle, outcome);
            self.stats.record(
                &self.route.provider,
                &self.route.model,
                outcome,
                self.started.elapsed(),
                tokens,
            );
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            tracing::debug!(
                provider = %self.route.provider,
                model = %self.route.model,
                "call dropped before completion"
            );
            self.settle(&Outcome::TransientError("call cancelled".to_string()), 0);
        }
    }
}

/// Entry point for catalog queries and completion dispatch
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ProviderRegistry>,
    keys: KeyRing,
    cache: Arc<ModelCache>,
    stats: UsageTracker,
    request_timeout: Duration,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            clock: Arc::new(SystemClock),
            store: None,
            persist: true,
            clients: Vec::new(),
        }
    }

    /// Create a gateway from a config object
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Create a gateway from the default configuration sources
    pub fn load() -> Result<Self> {
        Self::from_config(ConfigLoader::new()?.into_config())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn stats(&self) -> &UsageTracker {
        &self.stats
    }

    /// Provider names in registration order
    pub fn providers(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Load persisted catalogs and statistics. Failures are logged.
    pub async fn restore(&self) {
        match self.cache.load_from_store().await {
            Ok(0) => {}
            Ok(count) => tracing::info!(catalogs = count, "restored model catalogs"),
            Err(e) => tracing::warn!(error = %e, "failed to load persisted catalogs"),
        }
        match self.stats.restore().await {
            Ok(0) => {}
            Ok(count) => tracing::info!(records = count, "restored usage statistics"),
            Err(e) => tracing::warn!(error = %e, "failed to load persisted statistics"),
        }
    }

    /// Restore state, run the startup refresh if configured, and start background tasks
    pub async fn start(self: &Arc<Self>) -> BackgroundTasks {
        self.restore().await;
        if self.config.models_cache.refresh_on_startup {
            let _ = self.refresh_models(None).await;
        }
        self.spawn_background()
    }

    /// Add a provider at runtime; keys join its pool
    pub fn register_provider(
        &self,
        name: &str,
        client: Arc<dyn ProviderClient>,
        keys: Vec<String>,
    ) {
        self.registry.register(name, client);
        let limits = limits_for(&self.config, name);
        match self.keys.pool(name) {
            Some(pool) => {
                for key in keys {
                    pool.add_key(SecretString::from(key), limits);
                }
            }
            None => {
                self.keys.register_keys(
                    name,
                    keys.into_iter()
                        .map(|k| (SecretString::from(k), limits))
                        .collect(),
                    policy_for(&self.config, name),
                );
            }
        }
        tracing::info!(provider = %name, "provider added");
    }

    fn selected_providers(&self, provider: Option<&str>) -> Result<Vec<String>> {
        match provider {
            Some(name) if self.registry.contains(name) => Ok(vec![name.to_string()]),
            Some(name) => Err(GatewayError::ProviderNotFound(name.to_string())),
            None => Ok(self.registry.names()),
        }
    }

    /// Cached catalog; a stale one is refreshed in the background
    fn catalog(&self, provider: &str) -> Option<Arc<ModelCatalog>> {
        if self.cache.needs_refresh(provider) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                tracing::debug!(provider, "catalog stale, refreshing in background");
                let cache = Arc::clone(&self.cache);
                let provider = provider.to_string();
                runtime.spawn(async move {
                    // failures are recorded by the cache
                    let _ = cache.refresh(&provider).await;
                });
            }
        }
        self.cache.get_catalog(provider)
    }

    /// Models per provider, in catalog order
    pub fn models_by_provider(
        &self,
        provider: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<ModelDescriptor>>> {
        Ok(self
            .selected_providers(provider)?
            .into_iter()
            .map(|name| {
                let models = self
                    .catalog(&name)
                    .map(|c| c.models.clone())
                    .unwrap_or_default();
                (name, models)
            })
            .collect())
    }

    fn all_models(&self) -> Vec<ProviderModel> {
        self.registry
            .names()
            .into_iter()
            .filter_map(|name| self.catalog(&name))
            .flat_map(|catalog| {
                catalog
                    .models
                    .iter()
                    .map(|model| ProviderModel {
                        provider: catalog.provider.clone(),
                        model: model.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Models grouped by category tag; a model appears under each of its tags
    pub fn models_by_category(
        &self,
        category: Option<&str>,
    ) -> BTreeMap<String, Vec<ProviderModel>> {
        let mut grouped: BTreeMap<String, Vec<ProviderModel>> = BTreeMap::new();
        for entry in self.all_models() {
            for tag in &entry.model.categories {
                if category.map_or(true, |wanted| wanted == tag.as_str()) {
                    grouped.entry(tag.clone()).or_default().push(entry.clone());
                }
            }
        }
        grouped
    }

    /// Case-insensitive search over id, name and description
    pub fn search_models(&self, query: &str, provider: Option<&str>) -> Result<Vec<ProviderModel>> {
        let providers = self.selected_providers(provider)?;
        Ok(self
            .all_models()
            .into_iter()
            .filter(|entry| providers.contains(&entry.provider))
            .filter(|entry| matches_query(&entry.model, query))
            .collect())
    }

    /// Known categories with cached model counts
    pub fn categories(&self) -> Vec<CategorySummary> {
        let models = self.all_models();
        self.cache
            .filter()
            .categories()
            .into_iter()
            .map(|info| {
                let model_count = models
                    .iter()
                    .filter(|m| m.model.has_category(&info.category))
                    .count();
                CategorySummary { info, model_count }
            })
            .collect()
    }

    /// Force-refresh one or all providers concurrently
    pub async fn refresh_models(&self, provider: Option<&str>) -> Result<RefreshReport> {
        let providers = self.selected_providers(provider)?;
        let results =
            futures::future::join_all(providers.iter().map(|p| self.cache.force_refresh(p))).await;

        let report = build_report(providers, results);
        tracing::info!(
            updated = report.updated.len(),
            failed = report.errors.len(),
            models = report.total_models,
            "model refresh finished"
        );
        Ok(report)
    }

    /// Refresh only providers whose catalog is missing or stale
    pub async fn refresh_stale(&self) -> RefreshReport {
        let providers: Vec<String> = self
            .registry
            .names()
            .into_iter()
            .filter(|p| self.cache.is_stale(p))
            .collect();
        let results =
            futures::future::join_all(providers.iter().map(|p| self.cache.refresh(p))).await;
        build_report(providers, results)
    }

    /// Find the provider serving `model`.
    ///
    /// Cached catalogs win (in registration order), then an explicit
    /// `provider/model` prefix, then the configured static model lists.
    pub fn resolve_route(&self, model: &str) -> Result<(ModelRoute, RouteSource)> {
        let providers = self.registry.names();

        for provider in &providers {
            if self
                .cache
                .get_catalog(provider)
                .is_some_and(|catalog| catalog.contains(model))
            {
                return Ok((ModelRoute::new(provider, model), RouteSource::Catalog));
            }
        }

        if let Some(route) = ModelRoute::parse_prefixed(model, |p| self.registry.contains(p)) {
            return Ok((route, RouteSource::Prefix));
        }

        for provider in &providers {
            if self
                .config
                .providers
                .get(provider)
                .is_some_and(|p| p.models.iter().any(|m| m == model))
            {
                return Ok((ModelRoute::new(provider, model), RouteSource::Configured));
            }
        }

        Err(GatewayError::ModelNotFound(model.to_string()))
    }

    /// Route a completion, rotating keys on per-key failures
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let (route, source) = self.resolve_route(&request.model)?;
        let client = self
            .registry
            .get(&route.provider)
            .ok_or_else(|| GatewayError::ProviderNotFound(route.provider.clone()))?;
        let pool = self
            .keys
            .pool(&route.provider)
            .ok_or_else(|| GatewayError::ProviderNotFound(route.provider.clone()))?;
        let request = request.for_model(&route.model);

        tracing::debug!(
            provider = %route.provider,
            model = %route.model,
            source = ?source,
            "dispatching completion"
        );

        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<ProviderError> = None;

        while tried.len() < pool.len() {
            let Ok(handle) = pool.acquire_excluding(&tried) else {
                break;
            };
            tried.push(handle.key_name().to_string());

            let guard = CallGuard {
                pool: &pool,
                stats: &self.stats,
                route: &route,
                handle: Some(handle),
                started: Instant::now(),
            };
            let Some(key) = guard.key() else {
                continue;
            };

            let call = client.complete(key, &request);
            let result = match tokio::time::timeout(self.request_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Transient(format!(
                    "no response within {}s",
                    self.request_timeout.as_secs()
                ))),
            };

            match result {
                Ok(response) => {
                    guard.finish(&Outcome::Success, response.total_tokens());
                    return Ok(response);
                }
                Err(error) => {
                    let outcome = Outcome::from(&error);
                    guard.finish(&outcome, 0);
                    tracing::debug!(
                        provider = %route.provider,
                        key = ?tried.last(),
                        error = %error,
                        "attempt failed"
                    );
                    if outcome == Outcome::Rejected {
                        return Err(GatewayError::Upstream {
                            provider: route.provider,
                            source: error,
                        });
                    }
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) if pool.has_active_key() => Err(GatewayError::Upstream {
                provider: route.provider,
                source: error,
            }),
            _ => {
                tracing::warn!(
                    provider = %route.provider,
                    attempts = tried.len(),
                    "no usable key left"
                );
                Err(GatewayError::NoAvailableKey(route.provider))
            }
        }
    }

    /// Key and catalog health of one or all providers
    pub fn provider_status(&self, provider: Option<&str>) -> Result<Vec<ProviderStatus>> {
        Ok(self
            .selected_providers(provider)?
            .into_iter()
            .filter_map(|name| {
                let keys = self.keys.pool(&name)?.status();
                Some(ProviderStatus {
                    available: keys.available,
                    catalog: self.cache.info(&name),
                    provider: name,
                    keys,
                })
            })
            .collect())
    }

    pub fn statistics(&self) -> StatisticsReport {
        let records = self.stats.snapshot();
        StatisticsReport {
            summary: UsageSummary::from_records(&records),
            records,
        }
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Persist statistics now; returns whether anything was written
    pub async fn flush_statistics(&self) -> bool {
        match self.stats.flush().await {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist usage statistics");
                false
            }
        }
    }

    /// Add a key to a provider's pool; false if it is already there
    pub fn add_key(&self, provider: &str, secret: String) -> Result<bool> {
        let pool = self
            .keys
            .pool(provider)
            .ok_or_else(|| GatewayError::ProviderNotFound(provider.to_string()))?;
        Ok(pool.add_key(SecretString::from(secret), limits_for(&self.config, provider)))
    }

    /// Manually enable or disable a key by name
    pub fn set_key_enabled(&self, provider: &str, key: &str, enabled: bool) -> Result<()> {
        let pool = self
            .keys
            .pool(provider)
            .ok_or_else(|| GatewayError::ProviderNotFound(provider.to_string()))?;
        if pool.set_enabled(key, enabled) {
            Ok(())
        } else {
            Err(GatewayError::KeyNotFound {
                provider: provider.to_string(),
                key: key.to_string(),
            })
        }
    }

    /// Spawn catalog refresh (one task per provider), key sweep and statistics flush
    pub fn spawn_background(self: &Arc<Self>) -> BackgroundTasks {
        let (shutdown, watcher) = watch::channel(false);
        let mut handles = Vec::new();

        let check_every = self
            .cache
            .max_age()
            .to_std()
            .unwrap_or(Duration::from_secs(3600))
            .clamp(Duration::from_secs(1), Duration::from_secs(3600));

        for provider in self.registry.names() {
            let cache = Arc::clone(&self.cache);
            handles.push(spawn_periodic(check_every, watcher.clone(), move || {
                let cache = Arc::clone(&cache);
                let provider = provider.clone();
                async move {
                    if cache.is_stale(&provider) {
                        let _ = cache.refresh(&provider).await;
                    }
                }
            }));
        }

        let sweep_every = Duration::from_secs(self.config.rotation.sweep_interval_secs.max(1));
        let gateway = Arc::clone(self);
        handles.push(spawn_periodic(sweep_every, watcher.clone(), move || {
            let gateway = Arc::clone(&gateway);
            async move {
                let reactivated = gateway.keys.sweep();
                if reactivated > 0 {
                    tracing::debug!(reactivated, "key sweep");
                }
            }
        }));

        if self.stats.is_enabled() {
            let flush_every =
                Duration::from_secs(self.config.statistics.flush_interval_secs.max(1));
            let gateway = Arc::clone(self);
            handles.push(spawn_periodic(flush_every, watcher, move || {
                let gateway = Arc::clone(&gateway);
                async move {
                    gateway.flush_statistics().await;
                }
            }));
        }

        tracing::info!(tasks = handles.len(), "background tasks started");
        BackgroundTasks {
            gateway: Arc::clone(self),
            shutdown,
            handles,
        }
    }
}

fn build_report(
    providers: Vec<String>,
    results: Vec<std::result::Result<Arc<ModelCatalog>, error::FetchError>>,
) -> RefreshReport {
    let mut report = RefreshReport::default();
    for (provider, result) in providers.into_iter().zip(results) {
        match result {
            Ok(catalog) => {
                report.total_models += catalog.len();
                report.updated.insert(provider, catalog.len());
            }
            Err(e) => {
                report.errors.insert(provider, e.message);
            }
        }
    }
    report
}

fn spawn_periodic<F, Fut>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Handles of the gateway's periodic tasks
pub struct BackgroundTasks {
    gateway: Arc<Gateway>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stop every task and flush statistics one last time
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        self.gateway.flush_statistics().await;
        tracing::info!("background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{ScriptedClient, SCRIPTED_TOKENS};
    use crate::clock::ManualClock;
    use crate::router::KeyState;
    use crate::storage::MemoryStore;
    use chrono::{TimeZone, Utc};

    struct Harness {
        gateway: Arc<Gateway>,
        client: Arc<ScriptedClient>,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    }

    fn test_config(keys: &[&str], strategy: &str, per_minute: Option<u32>) -> GatewayConfig {
        serde_json::from_value(serde_json::json!({
            "providers": {
                "p": {
                    "base_url": "http://provider.invalid/v1",
                    "models": ["static-model"],
                    "rate_limit": { "requests_per_minute": per_minute }
                }
            },
            "key_pools": {
                "p": { "keys": keys, "rotation_strategy": strategy }
            },
            "model_filters": {
                "text_generation": { "keywords": ["gpt"] },
                "image_generation": { "keywords": ["vision", "image"] }
            },
            "rotation": { "max_errors_before_disable": 3, "retry_blocked_key_after_hours": 24 },
            "statistics": { "flush_interval_secs": 60 }
        }))
        .unwrap()
    }

    fn harness(config: GatewayConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap(),
        ));
        let client = Arc::new(
            ScriptedClient::new("p").with_models(&["gpt-4-vision", "gpt-4o", "whisper-1"]),
        );
        let store = Arc::new(MemoryStore::new());
        let gateway = Gateway::builder(config)
            .clock(clock.clone())
            .store(store.clone())
            .client("p", client.clone())
            .build()
            .unwrap();

        Harness {
            gateway: Arc::new(gateway),
            client,
            clock,
            store,
        }
    }

    fn ask(model: &str) -> CompletionRequest {
        CompletionRequest::new(model, vec![Message::user("hi")])
    }

    fn key_status(h: &Harness, index: usize) -> router::CredentialStatus {
        h.gateway.provider_status(Some("p")).unwrap()[0].keys.keys[index].clone()
    }

    #[tokio::test]
    async fn test_second_call_rotates_after_provider_rate_limit() {
        let h = harness(test_config(&["A", "B"], "sticky", None));
        h.client.script(
            "A",
            vec![Ok(()), Err(ProviderError::RateLimited { retry_after: Some(30) })],
        );

        for _ in 0..3 {
            tokio_test::assert_ok!(h.gateway.complete(ask("p/gpt-4o")).await);
        }

        // First attempts of the three calls went to A, A, B
        assert_eq!(h.client.calls(), vec!["A", "A", "B", "B"]);
        let a = key_status(&h, 0);
        assert_eq!(a.state, KeyState::Blocked);
        assert_eq!(
            a.blocked_until,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_local_minute_limit_spreads_then_exhausts() {
        let h = harness(test_config(&["A", "B"], "round_robin", Some(1)));

        h.gateway.complete(ask("p/gpt-4o")).await.unwrap();
        h.gateway.complete(ask("p/gpt-4o")).await.unwrap();
        let err = h.gateway.complete(ask("p/gpt-4o")).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(h.client.calls(), vec!["A", "B"]);

        h.clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap());
        h.gateway.complete(ask("p/gpt-4o")).await.unwrap();
        assert_eq!(h.client.calls(), vec!["A", "B", "A"]);
    }

    #[tokio::test]
    async fn test_all_keys_blocked_is_no_available_key() {
        let h = harness(test_config(&["A"], "round_robin", None));
        h.client
            .script("A", vec![Err(ProviderError::RateLimited { retry_after: None })]);

        let err = tokio_test::assert_err!(h.gateway.complete(ask("p/gpt-4o")).await);
        assert!(matches!(err, GatewayError::NoAvailableKey(ref p) if p == "p"));
        assert_eq!(h.client.calls(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_auth_error_rotates_to_next_key() {
        let h = harness(test_config(&["A", "B"], "round_robin", None));
        h.client
            .script("A", vec![Err(ProviderError::Auth("revoked".to_string()))]);

        let response = h.gateway.complete(ask("p/gpt-4o")).await.unwrap();
        assert_eq!(response.content(), Some("answered with B".to_string()));

        let a = key_status(&h, 0);
        assert_eq!(a.state, KeyState::Active);
        assert_eq!(a.consecutive_errors, 1);
        assert_eq!(a.last_error.as_deref(), Some("revoked"));
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_rotated() {
        let h = harness(test_config(&["A", "B"], "round_robin", None));
        h.client.script(
            "A",
            vec![Err(ProviderError::InvalidRequest("bad param".to_string()))],
        );

        let err = h.gateway.complete(ask("p/gpt-4o")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Upstream { source: ProviderError::InvalidRequest(_), .. }
        ));
        assert_eq!(h.client.calls(), vec!["A"]);
        assert_eq!(key_status(&h, 0).consecutive_errors, 0);
        assert_eq!(h.gateway.statistics().summary.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_on_every_key_surface_upstream_error() {
        let h = harness(test_config(&["A", "B"], "round_robin", None));
        let boom = || Err(ProviderError::Transient("502".to_string()));
        h.client.script("A", vec![boom()]);
        h.client.script("B", vec![boom()]);

        let err = h.gateway.complete(ask("p/gpt-4o")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Upstream { source: ProviderError::Transient(_), .. }
        ));
        assert_eq!(h.client.calls(), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout_counts_as_transient() {
        let mut config = test_config(&["A"], "round_robin", None);
        config.request_timeout_secs = 2;
        let h = harness(config);
        h.client.set_call_delay(Duration::from_secs(30));

        let err = h.gateway.complete(ask("p/gpt-4o")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Upstream { source: ProviderError::Transient(_), .. }
        ));
        let a = key_status(&h, 0);
        assert_eq!(a.consecutive_errors, 1);
        assert_eq!(a.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_is_still_reported() {
        let h = harness(test_config(&["A"], "round_robin", None));
        h.client.set_call_delay(Duration::from_secs(30));

        let outcome =
            tokio::time::timeout(Duration::from_secs(1), h.gateway.complete(ask("p/gpt-4o"))).await;
        assert!(outcome.is_err());

        let a = key_status(&h, 0);
        assert_eq!(a.in_flight, 0);
        assert_eq!(a.consecutive_errors, 1);
        assert_eq!(a.total_requests, 1);
        assert_eq!(h.gateway.statistics().summary.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_success_records_usage() {
        let h = harness(test_config(&["A"], "round_robin", None));
        h.gateway.complete(ask("p/gpt-4o")).await.unwrap();
        h.gateway.complete(ask("p/gpt-4o")).await.unwrap();

        let report = h.gateway.statistics();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].model, "gpt-4o");
        assert_eq!(report.summary.successful_requests, 2);
        assert_eq!(report.summary.total_tokens, 2 * SCRIPTED_TOKENS as u64);

        h.gateway.reset_statistics();
        assert_eq!(h.gateway.statistics().summary.total_requests, 0);
    }

    #[tokio::test]
    async fn test_route_resolution_order() {
        let h = harness(test_config(&["A"], "round_robin", None));
        h.gateway.refresh_models(None).await.unwrap();

        let (route, source) = h.gateway.resolve_route("gpt-4o").unwrap();
        assert_eq!((route.provider.as_str(), source), ("p", RouteSource::Catalog));

        let (route, source) = h.gateway.resolve_route("p/custom").unwrap();
        assert_eq!(route.model, "custom");
        assert_eq!(source, RouteSource::Prefix);

        let (_, source) = h.gateway.resolve_route("static-model").unwrap();
        assert_eq!(source, RouteSource::Configured);

        assert!(matches!(
            h.gateway.resolve_route("nowhere"),
            Err(GatewayError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_views() {
        let h = harness(test_config(&["A"], "round_robin", None));
        h.gateway.refresh_models(None).await.unwrap();

        let by_provider = h.gateway.models_by_provider(None).unwrap();
        assert_eq!(by_provider["p"].len(), 3);

        let by_category = h.gateway.models_by_category(None);
        let ids = |tag: &str| -> Vec<String> {
            by_category[tag].iter().map(|m| m.model.id.clone()).collect()
        };
        assert_eq!(ids("image_generation"), vec!["gpt-4-vision"]);
        assert_eq!(ids("text_generation"), vec!["gpt-4-vision", "gpt-4o"]);
        assert_eq!(ids("uncategorized"), vec!["whisper-1"]);

        let images = h.gateway.models_by_category(Some("image_generation"));
        assert_eq!(images.len(), 1);

        let found = h.gateway.search_models("VISION", None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].provider, "p");
        assert!(h.gateway.search_models("gpt", Some("missing")).is_err());

        let counts: Vec<(String, usize)> = h
            .gateway
            .categories()
            .into_iter()
            .map(|c| (c.info.category, c.model_count))
            .collect();
        assert_eq!(
            counts,
            vec![
                ("image_generation".to_string(), 1),
                ("text_generation".to_string(), 2),
                ("uncategorized".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_refresh_report_keeps_previous_catalog_on_failure() {
        let h = harness(test_config(&["A"], "round_robin", None));
        let first = h.gateway.refresh_models(Some("p")).await.unwrap();
        assert_eq!(first.updated["p"], 3);
        assert_eq!(first.total_models, 3);

        h.client.fail_listing("maintenance");
        let second = h.gateway.refresh_models(None).await.unwrap();
        assert_eq!(second.errors["p"], "maintenance");
        assert_eq!(h.gateway.models_by_provider(Some("p")).unwrap()["p"].len(), 3);
        assert_eq!(h.store.catalog("p").unwrap().models.len(), 3);

        let status = &h.gateway.provider_status(Some("p")).unwrap()[0];
        assert_eq!(status.catalog.last_error.as_deref(), Some("maintenance"));
    }

    #[tokio::test]
    async fn test_stale_read_refreshes_in_background() {
        let h = harness(test_config(&["A"], "round_robin", None));

        let first = h.gateway.models_by_provider(None).unwrap();
        assert!(first["p"].is_empty());

        for _ in 0..100 {
            if h.gateway.cache().get_catalog("p").is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.gateway.models_by_provider(None).unwrap()["p"].len(), 3);
        assert_eq!(h.client.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_key_administration() {
        let h = harness(test_config(&["A", "B"], "round_robin", None));

        assert!(h.gateway.add_key("p", "C".to_string()).unwrap());
        assert!(!h.gateway.add_key("p", "C".to_string()).unwrap());
        assert!(matches!(
            h.gateway.add_key("nope", "X".to_string()),
            Err(GatewayError::ProviderNotFound(_))
        ));

        h.gateway.set_key_enabled("p", "p_key_1", false).unwrap();
        h.gateway.complete(ask("p/gpt-4o")).await.unwrap();
        assert_eq!(h.client.calls(), vec!["B"]);
        assert_eq!(key_status(&h, 0).state, KeyState::Disabled);

        assert!(matches!(
            h.gateway.set_key_enabled("p", "p_key_9", true),
            Err(GatewayError::KeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_provider_status_counts_states() {
        let h = harness(test_config(&["A", "B"], "round_robin", None));
        h.client
            .script("A", vec![Err(ProviderError::QuotaExceeded("daily".to_string()))]);
        h.gateway.complete(ask("p/gpt-4o")).await.unwrap();

        let status = &h.gateway.provider_status(None).unwrap()[0];
        assert!(status.available);
        assert_eq!(status.keys.total_keys, 2);
        assert_eq!(status.keys.exhausted, 1);
        assert_eq!(status.keys.active, 1);
        assert_eq!(status.catalog.model_count, 0);
    }

    #[tokio::test]
    async fn test_provider_added_at_runtime() {
        let h = harness(test_config(&["A"], "round_robin", None));
        let other = Arc::new(ScriptedClient::new("q"));
        h.gateway
            .register_provider("q", other.clone(), vec!["Q1".to_string()]);

        h.gateway.complete(ask("q/some-model")).await.unwrap();
        assert_eq!(other.calls(), vec!["Q1"]);
        assert!(h.client.calls().is_empty());
        assert_eq!(h.gateway.providers(), vec!["p", "q"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_refresh_flush_and_shutdown() {
        let h = harness(test_config(&["A"], "round_robin", None));
        let tasks = h.gateway.start().await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.gateway.cache().get_catalog("p").is_some());

        h.gateway.complete(ask("gpt-4o")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.store.usage()[0].total_calls, 1);

        h.gateway.complete(ask("gpt-4o")).await.unwrap();
        tasks.shutdown().await;
        assert_eq!(h.store.usage()[0].total_calls, 2);
    }

    #[tokio::test]
    async fn test_restore_reuses_persisted_state() {
        let h = harness(test_config(&["A"], "round_robin", None));
        h.gateway.refresh_models(None).await.unwrap();
        h.gateway.complete(ask("gpt-4o")).await.unwrap();
        assert!(h.gateway.flush_statistics().await);

        let client = Arc::new(ScriptedClient::new("p"));
        let restarted = Gateway::builder(test_config(&["A"], "round_robin", None))
            .clock(h.clock.clone())
            .store(h.store.clone())
            .client("p", client.clone())
            .build()
            .unwrap();
        restarted.restore().await;

        assert_eq!(restarted.cache().get_catalog("p").unwrap().len(), 3);
        assert_eq!(restarted.statistics().summary.total_requests, 1);
        assert_eq!(client.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_catalog_listing_authenticates_with_key_pool_key() {
        let mut server = mockito::Server::new_async().await;
        let listing = server
            .mock("GET", "/v1/models")
            .match_header("authorization", "Bearer pool-key-1")
            .with_status(200)
            .with_body(r#"{"data":[{"id":"pooled-model"}]}"#)
            .create_async()
            .await;

        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "providers": { "pooled": { "base_url": format!("{}/v1", server.url()) } },
            "key_pools": { "pooled": { "keys": ["pool-key-1", "pool-key-2"] } }
        }))
        .unwrap();
        let gateway = Gateway::builder(config).without_storage().build().unwrap();

        let report = gateway.refresh_models(Some("pooled")).await.unwrap();
        listing.assert_async().await;
        assert_eq!(report.updated["pooled"], 1);

        let (route, source) = gateway.resolve_route("pooled-model").unwrap();
        assert_eq!((route.provider.as_str(), source), ("pooled", RouteSource::Catalog));
    }
}
