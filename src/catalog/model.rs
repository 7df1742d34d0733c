//! Model Descriptors
//!
//! Immutable catalog entries. A catalog is rebuilt wholesale on every refresh
//! and shared behind an `Arc`, so readers never see a partial one.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capability flags advertised for a model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub function_calling: bool,
}

/// One model exposed by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Provider-local model id
    pub id: String,

    /// Display name (defaults to the id)
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Category tags, filled in by the category filter
    #[serde(default)]
    pub categories: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,

    #[serde(default)]
    pub capabilities: ModelCapabilities,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            categories: BTreeSet::new(),
            context_length: None,
            capabilities: ModelCapabilities::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_context_length(mut self, context_length: u32) -> Self {
        self.context_length = Some(context_length);
        self
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.contains(category)
    }
}

/// Models of one provider as of one successful fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub provider: String,
    pub models: Vec<ModelDescriptor>,
    pub fetched_at: DateTime<Utc>,
}

impl ModelCatalog {
    pub fn new(
        provider: impl Into<String>,
        models: Vec<ModelDescriptor>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider: provider.into(),
            models,
            fetched_at,
        }
    }

    /// Younger than `max_age` at `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: TimeDelta) -> bool {
        now - self.fetched_at < max_age
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == model_id)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.get(model_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_descriptor_defaults_name_to_id() {
        let model = ModelDescriptor::new("gpt-4o").with_context_length(128_000);
        assert_eq!(model.name, "gpt-4o");
        assert_eq!(model.context_length, Some(128_000));
        assert!(model.categories.is_empty());
    }

    #[test]
    fn test_catalog_freshness() {
        let fetched = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let catalog = ModelCatalog::new("p", vec![ModelDescriptor::new("m")], fetched);

        assert!(catalog.is_fresh(fetched + TimeDelta::hours(23), TimeDelta::hours(24)));
        assert!(!catalog.is_fresh(fetched + TimeDelta::hours(24), TimeDelta::hours(24)));
        assert!(catalog.contains("m"));
        assert!(!catalog.contains("other"));
    }

    #[test]
    fn test_descriptor_deserializes_sparse_json() {
        let model: ModelDescriptor =
            serde_json::from_str(r#"{ "id": "m", "name": "Model M" }"#).unwrap();
        assert_eq!(model.description, "");
        assert!(!model.capabilities.vision);
    }
}
