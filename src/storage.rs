//! Durable Storage
//!
//! Persistence for catalog snapshots and usage aggregates. Writes are
//! best-effort: callers log failures and keep their in-memory state.

use crate::catalog::ModelCatalog;
use crate::error::{GatewayError, Result};
use crate::stats::UsageRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Storage backend for catalogs and usage records
#[async_trait]
pub trait SnapshotStore: Send + Sync + Debug {
    /// Every persisted catalog
    async fn load_catalogs(&self) -> Result<Vec<ModelCatalog>>;

    /// Replace the persisted catalog of `catalog.provider`
    async fn save_catalog(&self, catalog: &ModelCatalog) -> Result<()>;

    async fn load_usage(&self) -> Result<Vec<UsageRecord>>;

    /// Replace all persisted usage records
    async fn save_usage(&self, records: &[UsageRecord]) -> Result<()>;
}

/// JSON files under one directory:
/// `catalogs/<provider>.json` and `usage.json`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn catalogs_dir(&self) -> PathBuf {
        self.root.join("catalogs")
    }

    fn catalog_path(&self, provider: &str) -> PathBuf {
        let file_name: String = provider
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.catalogs_dir().join(format!("{}.json", file_name))
    }

    fn usage_path(&self) -> PathBuf {
        self.root.join("usage.json")
    }

    /// Write through a temp file so a crash never leaves a torn snapshot
    async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load_catalogs(&self) -> Result<Vec<ModelCatalog>> {
        let dir = self.catalogs_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut catalogs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<ModelCatalog>(&content) {
                Ok(catalog) => catalogs.push(catalog),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable catalog snapshot"
                    );
                }
            }
        }
        Ok(catalogs)
    }

    async fn save_catalog(&self, catalog: &ModelCatalog) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(catalog)?;
        Self::write_atomic(&self.catalog_path(&catalog.provider), bytes).await
    }

    async fn load_usage(&self) -> Result<Vec<UsageRecord>> {
        match tokio::fs::read(self.usage_path()).await {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_usage(&self, records: &[UsageRecord]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        Self::write_atomic(&self.usage_path(), bytes).await
    }
}

/// In-process store for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    catalogs: Mutex<BTreeMap<String, ModelCatalog>>,
    usage: Mutex<Vec<UsageRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::Storage("writes disabled".to_string()));
        }
        Ok(())
    }

    pub fn catalog(&self, provider: &str) -> Option<ModelCatalog> {
        self.catalogs.lock().get(provider).cloned()
    }

    pub fn usage(&self) -> Vec<UsageRecord> {
        self.usage.lock().clone()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load_catalogs(&self) -> Result<Vec<ModelCatalog>> {
        Ok(self.catalogs.lock().values().cloned().collect())
    }

    async fn save_catalog(&self, catalog: &ModelCatalog) -> Result<()> {
        self.check_writable()?;
        self.catalogs
            .lock()
            .insert(catalog.provider.clone(), catalog.clone());
        Ok(())
    }

    async fn load_usage(&self) -> Result<Vec<UsageRecord>> {
        Ok(self.usage.lock().clone())
    }

    async fn save_usage(&self, records: &[UsageRecord]) -> Result<()> {
        self.check_writable()?;
        *self.usage.lock() = records.to_vec();
        Ok(())
    }
}
