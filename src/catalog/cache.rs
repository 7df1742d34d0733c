//! Model Cache
//!
//! Last good catalog per provider. Readers get an `Arc` snapshot and never
//! wait on the network; refreshes are single-flighted per provider and swap
//! the new catalog in with one map write.

use crate::catalog::filter::CategoryFilter;
use crate::catalog::model::ModelCatalog;
use crate::client::ProviderRegistry;
use crate::clock::Clock;
use crate::error::FetchError;
use crate::storage::SnapshotStore;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Minimum gap before a read-triggered refresh retries a failed provider
const FAILED_REFRESH_BACKOFF_MINUTES: i64 = 5;

/// Per-provider refresh gate
#[derive(Debug, Default)]
struct Flight {
    lock: tokio::sync::Mutex<()>,
    /// Finished attempts, successful or not
    completed: AtomicU64,
}

#[derive(Debug, Clone)]
struct RefreshFailure {
    error: FetchError,
    at: DateTime<Utc>,
}

/// Cache state of one provider
#[derive(Debug, Clone, Serialize)]
pub struct CatalogInfo {
    pub provider: String,
    pub model_count: usize,
    pub fetched_at: Option<DateTime<Utc>>,
    pub fresh: bool,
    pub refreshing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct ModelCache {
    catalogs: RwLock<HashMap<String, Arc<ModelCatalog>>>,
    flights: Mutex<HashMap<String, Arc<Flight>>>,
    failures: RwLock<HashMap<String, RefreshFailure>>,
    registry: Arc<ProviderRegistry>,
    filter: CategoryFilter,
    max_age: TimeDelta,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl ModelCache {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        filter: CategoryFilter,
        max_age: TimeDelta,
        clock: Arc<dyn Clock>,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        Self {
            catalogs: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            registry,
            filter,
            max_age,
            clock,
            store,
        }
    }

    pub fn filter(&self) -> &CategoryFilter {
        &self.filter
    }

    pub fn max_age(&self) -> TimeDelta {
        self.max_age
    }

    /// Last successfully fetched catalog; never touches the network
    pub fn get_catalog(&self, provider: &str) -> Option<Arc<ModelCatalog>> {
        self.catalogs.read().get(provider).cloned()
    }

    fn flight(&self, provider: &str) -> Arc<Flight> {
        Arc::clone(self.flights.lock().entry(provider.to_string()).or_default())
    }

    pub fn is_refreshing(&self, provider: &str) -> bool {
        self.flights
            .lock()
            .get(provider)
            .is_some_and(|flight| flight.lock.try_lock().is_err())
    }

    /// Missing or older than the refresh interval
    pub fn is_stale(&self, provider: &str) -> bool {
        let now = self.clock.now();
        self.get_catalog(provider)
            .map_or(true, |catalog| !catalog.is_fresh(now, self.max_age))
    }

    /// Stale, nobody is refreshing it, and it did not just fail
    pub fn needs_refresh(&self, provider: &str) -> bool {
        let now = self.clock.now();
        let recently_failed = self
            .failures
            .read()
            .get(provider)
            .is_some_and(|f| now - f.at < TimeDelta::minutes(FAILED_REFRESH_BACKOFF_MINUTES));
        self.is_stale(provider) && !recently_failed && !self.is_refreshing(provider)
    }

    /// Refresh `provider`, joining an in-flight refresh instead of starting a second one.
    ///
    /// On failure the previous catalog stays in place.
    pub async fn refresh(&self, provider: &str) -> Result<Arc<ModelCatalog>, FetchError> {
        let flight = self.flight(provider);
        let seen = flight.completed.load(Ordering::Acquire);
        let _guard = flight.lock.lock().await;

        if flight.completed.load(Ordering::Acquire) != seen {
            // Someone finished a refresh while we waited; share its result
            if let Some(failure) = self.failures.read().get(provider) {
                return Err(failure.error.clone());
            }
            if let Some(catalog) = self.get_catalog(provider) {
                return Ok(catalog);
            }
        }

        let result = self.fetch_and_swap(provider).await;
        flight.completed.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// Always fetch, waiting for any in-flight refresh to finish first
    pub async fn force_refresh(&self, provider: &str) -> Result<Arc<ModelCatalog>, FetchError> {
        let flight = self.flight(provider);
        let _guard = flight.lock.lock().await;
        let result = self.fetch_and_swap(provider).await;
        flight.completed.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn fetch_and_swap(&self, provider: &str) -> Result<Arc<ModelCatalog>, FetchError> {
        match self.fetch(provider).await {
            Ok(catalog) => {
                self.failures.write().remove(provider);
                Ok(catalog)
            }
            Err(error) => {
                tracing::warn!(provider, error = %error, "model catalog refresh failed");
                self.failures.write().insert(
                    provider.to_string(),
                    RefreshFailure {
                        error: error.clone(),
                        at: self.clock.now(),
                    },
                );
                Err(error)
            }
        }
    }

    async fn fetch(&self, provider: &str) -> Result<Arc<ModelCatalog>, FetchError> {
        let client = self
            .registry
            .get(provider)
            .ok_or_else(|| FetchError::new(provider, "provider is not registered"))?;

        let mut models = client.list_models().await?;

        let mut seen = HashSet::new();
        models.retain(|m| seen.insert(m.id.clone()));
        self.filter.apply(&mut models);

        let catalog = Arc::new(ModelCatalog::new(provider, models, self.clock.now()));

        if let Some(store) = &self.store {
            if let Err(e) = store.save_catalog(&catalog).await {
                tracing::warn!(provider, error = %e, "failed to persist model catalog");
            }
        }

        self.catalogs
            .write()
            .insert(provider.to_string(), Arc::clone(&catalog));
        tracing::info!(provider, models = catalog.len(), "model catalog refreshed");
        Ok(catalog)
    }

    /// Seed catalogs from storage, re-tagging them with the current rules.
    ///
    /// Catalogs already in memory are kept.
    pub async fn load_from_store(&self) -> crate::error::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut loaded = 0;
        for mut catalog in store.load_catalogs().await? {
            self.filter.apply(&mut catalog.models);
            let mut catalogs = self.catalogs.write();
            if !catalogs.contains_key(&catalog.provider) {
                tracing::debug!(
                    provider = %catalog.provider,
                    models = catalog.len(),
                    "catalog restored"
                );
                catalogs.insert(catalog.provider.clone(), Arc::new(catalog));
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn info(&self, provider: &str) -> CatalogInfo {
        let now = self.clock.now();
        let catalog = self.get_catalog(provider);
        let failure = self.failures.read().get(provider).cloned();

        CatalogInfo {
            provider: provider.to_string(),
            model_count: catalog.as_ref().map_or(0, |c| c.len()),
            fetched_at: catalog.as_ref().map(|c| c.fetched_at),
            fresh: catalog.as_ref().is_some_and(|c| c.is_fresh(now, self.max_age)),
            refreshing: self.is_refreshing(provider),
            last_error: failure.as_ref().map(|f| f.error.message.clone()),
            last_error_at: failure.map(|f| f.at),
        }
    }
}
