//! Category Filter
//!
//! Keyword rules that tag models with categories at catalog-build time.

use crate::catalog::model::ModelDescriptor;
use crate::config::FilterConfig;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Tag given to models no rule matches
pub const UNCATEGORIZED: &str = "uncategorized";

/// Category name plus its lowercase keyword matchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRule {
    pub category: String,
    pub keywords: Vec<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
}

impl CategoryRule {
    pub fn new<I, S>(category: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            category: category.into(),
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            display_name: None,
            description: None,
        }
    }

    /// Any keyword is a substring of the lowercased id or name
    fn matches(&self, id: &str, name: &str) -> bool {
        self.keywords
            .iter()
            .any(|k| id.contains(k.as_str()) || name.contains(k.as_str()))
    }
}

/// Category summary for listings
#[derive(Debug, Clone, Serialize)]
pub struct CategoryInfo {
    pub category: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub keywords: Vec<String>,
}

/// Classifies models against a fixed set of rules
#[derive(Debug, Clone, Default)]
pub struct CategoryFilter {
    rules: Vec<CategoryRule>,
}

impl CategoryFilter {
    pub fn new(rules: Vec<CategoryRule>) -> Self {
        Self { rules }
    }

    /// Rules from the `model_filters` config section, in name order
    pub fn from_config(filters: &BTreeMap<String, FilterConfig>) -> Self {
        let rules = filters
            .iter()
            .map(|(name, filter)| {
                let category = filter.category.clone().unwrap_or_else(|| name.clone());
                CategoryRule {
                    display_name: filter.display_name.clone(),
                    description: filter.description.clone(),
                    ..CategoryRule::new(category, &filter.keywords)
                }
            })
            .collect();
        Self::new(rules)
    }

    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }

    /// Category tags for a model; never empty
    pub fn classify(&self, model: &ModelDescriptor) -> BTreeSet<String> {
        let id = model.id.to_lowercase();
        let name = model.name.to_lowercase();

        let mut tags: BTreeSet<String> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(&id, &name))
            .map(|rule| rule.category.clone())
            .collect();

        if tags.is_empty() {
            tags.insert(UNCATEGORIZED.to_string());
        }
        tags
    }

    /// Replace each model's tags with freshly classified ones
    pub fn apply(&self, models: &mut [ModelDescriptor]) {
        for model in models {
            model.categories = self.classify(model);
        }
    }

    /// Distinct categories, rules first, then the fallback tag
    pub fn categories(&self) -> Vec<CategoryInfo> {
        let mut seen = BTreeSet::new();
        let mut infos: Vec<CategoryInfo> = Vec::new();

        for rule in &self.rules {
            if seen.insert(rule.category.clone()) {
                infos.push(CategoryInfo {
                    category: rule.category.clone(),
                    display_name: rule
                        .display_name
                        .clone()
                        .unwrap_or_else(|| rule.category.clone()),
                    description: rule.description.clone(),
                    keywords: rule.keywords.clone(),
                });
            } else if let Some(info) = infos.iter_mut().find(|i| i.category == rule.category) {
                info.keywords.extend(rule.keywords.iter().cloned());
            }
        }

        infos.push(CategoryInfo {
            category: UNCATEGORIZED.to_string(),
            display_name: "Uncategorized".to_string(),
            description: None,
            keywords: Vec::new(),
        });
        infos
    }
}

/// Case-insensitive search over id, name and description
pub fn matches_query(model: &ModelDescriptor, query: &str) -> bool {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return true;
    }
    model.id.to_lowercase().contains(&query)
        || model.name.to_lowercase().contains(&query)
        || model.description.to_lowercase().contains(&query)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_filter() -> CategoryFilter {
        CategoryFilter::new(vec![
            CategoryRule::new("text_generation", ["gpt"]),
            CategoryRule::new("image_generation", ["vision", "image"]),
        ])
    }

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_multimodal_model_gets_both_tags() {
        let model = ModelDescriptor::new("gpt-4-vision");
        assert_eq!(
            sample_filter().classify(&model),
            tags(&["image_generation", "text_generation"])
        );
    }

    #[test]
    fn test_unmatched_model_is_uncategorized() {
        let model = ModelDescriptor::new("whisper-1");
        assert_eq!(sample_filter().classify(&model), tags(&[UNCATEGORIZED]));
    }

    #[test]
    fn test_matching_is_case_insensitive_on_name() {
        let model = ModelDescriptor::new("m-1").with_name("Super IMAGE Maker");
        assert_eq!(sample_filter().classify(&model), tags(&["image_generation"]));
    }

    #[test]
    fn test_description_does_not_classify() {
        let model = ModelDescriptor::new("m-2").with_description("a gpt-like model");
        assert_eq!(sample_filter().classify(&model), tags(&[UNCATEGORIZED]));
        assert!(matches_query(&model, "GPT-like"));
    }

    #[test]
    fn test_from_config_uses_category_override() {
        let mut filters = BTreeMap::new();
        filters.insert(
            "pictures".to_string(),
            FilterConfig {
                category: Some("image_generation".to_string()),
                keywords: vec!["DALL-E".to_string(), " ".to_string()],
                display_name: Some("Images".to_string()),
                description: None,
            },
        );

        let filter = CategoryFilter::from_config(&filters);
        assert_eq!(filter.rules()[0].category, "image_generation");
        assert_eq!(filter.rules()[0].keywords, vec!["dall-e"]);

        let categories = filter.categories();
        assert_eq!(categories[0].display_name, "Images");
        assert_eq!(categories.last().unwrap().category, UNCATEGORIZED);
    }

    #[test]
    fn test_apply_overwrites_stale_tags() {
        let mut models = vec![ModelDescriptor::new("gpt-4o")];
        models[0].categories.insert("old".to_string());
        sample_filter().apply(&mut models);
        assert_eq!(models[0].categories, tags(&["text_generation"]));
    }
}
