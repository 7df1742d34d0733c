//! Provider Registry
//!
//! Explicit name-to-client map built at startup. Registration order is kept
//! because model resolution checks providers in that order.

use crate::client::ProviderClient;
use parking_lot::RwLock;
use std::sync::Arc;

/// Registered provider clients
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    entries: RwLock<Vec<(String, Arc<dyn ProviderClient>)>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client, replacing one already registered under `name` in place
    pub fn register(&self, name: impl Into<String>, client: Arc<dyn ProviderClient>) {
        let name = name.into();
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = client,
            None => {
                tracing::debug!(provider = %name, "provider registered");
                entries.push((name, client));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderClient>> {
        self.entries
            .read()
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, client)| Arc::clone(client))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|(existing, _)| existing == name)
    }

    /// Provider names in registration order
    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
