//! Usage Statistics
//!
//! Per (provider, model) call counters. Writers only touch atomics once the
//! entry exists; snapshots never block writers for longer than a map read.

use crate::clock::Clock;
use crate::error::Result;
use crate::router::Outcome;
use crate::storage::SnapshotStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How many entries the summary's top lists hold
const TOP_N: usize = 5;

/// Aggregated counters for one (provider, model)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn average_latency_ms(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.total_calls as f64
        }
    }
}

#[derive(Debug, Default)]
struct UsageCounters {
    total_calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_latency_ms: AtomicU64,
    total_tokens: AtomicU64,
    /// Unix millis, 0 when never used
    last_used_ms: AtomicI64,
}

impl UsageCounters {
    fn seeded(record: &UsageRecord) -> Self {
        Self {
            total_calls: AtomicU64::new(record.total_calls),
            successes: AtomicU64::new(record.successes),
            failures: AtomicU64::new(record.failures),
            total_latency_ms: AtomicU64::new(record.total_latency_ms),
            total_tokens: AtomicU64::new(record.total_tokens),
            last_used_ms: AtomicI64::new(record.last_used.map_or(0, |t| t.timestamp_millis())),
        }
    }

    fn clear(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.total_latency_ms.store(0, Ordering::Relaxed);
        self.total_tokens.store(0, Ordering::Relaxed);
        self.last_used_ms.store(0, Ordering::Relaxed);
    }

    fn to_record(&self, provider: &str, model: &str) -> UsageRecord {
        let last_used_ms = self.last_used_ms.load(Ordering::Relaxed);
        UsageRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            last_used: (last_used_ms > 0)
                .then(|| DateTime::from_timestamp_millis(last_used_ms))
                .flatten(),
        }
    }
}

/// Count of calls for one name in a top list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageCount {
    pub name: String,
    pub calls: u64,
}

/// Roll-up over all records
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percentage, 0-100
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub total_tokens: u64,
    pub unique_providers: usize,
    pub unique_models: usize,
    pub top_models: Vec<UsageCount>,
    pub top_providers: Vec<UsageCount>,
}

impl UsageSummary {
    pub fn from_records(records: &[UsageRecord]) -> Self {
        let total_requests: u64 = records.iter().map(|r| r.total_calls).sum();
        let successful_requests: u64 = records.iter().map(|r| r.successes).sum();
        let failed_requests: u64 = records.iter().map(|r| r.failures).sum();
        let total_latency: u64 = records.iter().map(|r| r.total_latency_ms).sum();

        let mut by_provider: BTreeMap<&str, u64> = BTreeMap::new();
        for record in records {
            *by_provider.entry(record.provider.as_str()).or_default() += record.total_calls;
        }

        let model_counts = records
            .iter()
            .map(|r| (format!("{}/{}", r.provider, r.model), r.total_calls));
        let provider_counts = by_provider
            .iter()
            .map(|(name, calls)| (name.to_string(), *calls));

        Self {
            total_requests,
            successful_requests,
            failed_requests,
            success_rate: ratio(successful_requests, total_requests) * 100.0,
            average_latency_ms: ratio(total_latency, total_requests),
            total_tokens: records.iter().map(|r| r.total_tokens).sum(),
            unique_providers: by_provider.len(),
            unique_models: records.len(),
            top_models: top_n(model_counts),
            top_providers: top_n(provider_counts),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn top_n(counts: impl Iterator<Item = (String, u64)>) -> Vec<UsageCount> {
    let mut counts: Vec<UsageCount> = counts
        .filter(|(_, calls)| *calls > 0)
        .map(|(name, calls)| UsageCount { name, calls })
        .collect();
    counts.sort_by(|a, b| b.calls.cmp(&a.calls).then_with(|| a.name.cmp(&b.name)));
    counts.truncate(TOP_N);
    counts
}

type UsageKey = (String, String);

/// Concurrent usage recorder with batched persistence
#[derive(Debug)]
pub struct UsageTracker {
    records: RwLock<HashMap<UsageKey, Arc<UsageCounters>>>,
    dirty: AtomicBool,
    enabled: bool,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl UsageTracker {
    pub fn new(clock: Arc<dyn Clock>, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            enabled: true,
            clock,
            store,
        }
    }

    /// A tracker that ignores every record
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled: false,
            ..Self::new(clock, None)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn counters(&self, provider: &str, model: &str) -> Arc<UsageCounters> {
        let key = (provider.to_string(), model.to_string());
        if let Some(counters) = self.records.read().get(&key) {
            return Arc::clone(counters);
        }
        Arc::clone(self.records.write().entry(key).or_default())
    }

    /// Count one finished call
    pub fn record(
        &self,
        provider: &str,
        model: &str,
        outcome: &Outcome,
        latency: Duration,
        tokens: u64,
    ) {
        if !self.enabled {
            return;
        }
        let counters = self.counters(provider, model);

        counters.total_calls.fetch_add(1, Ordering::Relaxed);
        if outcome.is_success() {
            counters.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        counters.total_tokens.fetch_add(tokens, Ordering::Relaxed);
        counters
            .last_used_ms
            .fetch_max(self.clock.now().timestamp_millis(), Ordering::Relaxed);

        self.dirty.store(true, Ordering::Release);
        tracing::trace!(provider, model, outcome = outcome.label(), "usage recorded");
    }

    /// Records with at least one call, ordered by provider then model
    pub fn snapshot(&self) -> Vec<UsageRecord> {
        let entries: Vec<(UsageKey, Arc<UsageCounters>)> = self
            .records
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut records: Vec<UsageRecord> = entries
            .iter()
            .map(|((provider, model), counters)| counters.to_record(provider, model))
            .filter(|record| record.total_calls > 0)
            .collect();
        records.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        records
    }

    pub fn summary(&self) -> UsageSummary {
        UsageSummary::from_records(&self.snapshot())
    }

    /// Zero every counter; the empty state is persisted on the next flush.
    ///
    /// Entries stay in place so a call already holding its counters still lands.
    pub fn reset(&self) {
        for counters in self.records.write().values() {
            counters.clear();
        }
        self.dirty.store(true, Ordering::Release);
        tracing::info!("usage statistics reset");
    }

    /// Seed counters from persisted records
    pub fn load(&self, records: &[UsageRecord]) {
        let mut map = self.records.write();
        for record in records {
            map.insert(
                (record.provider.clone(), record.model.clone()),
                Arc::new(UsageCounters::seeded(record)),
            );
        }
    }

    /// Load persisted records from the store, if any
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records = store.load_usage().await?;
        self.load(&records);
        Ok(records.len())
    }

    /// Persist the snapshot if anything changed since the last flush.
    ///
    /// Returns whether a write happened. On failure the tracker stays dirty.
    pub async fn flush(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let records = self.snapshot();
        if let Err(e) = store.save_usage(&records).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        tracing::debug!(records = records.len(), "usage statistics flushed");
        Ok(true)
    }
}
