//! Catalog Module
//!
//! Model descriptors, category classification and the per-provider model cache.

pub mod cache;
pub mod filter;
pub mod model;

pub use cache::{CatalogInfo, ModelCache};
pub use filter::{matches_query, CategoryFilter, CategoryInfo, CategoryRule, UNCATEGORIZED};
pub use model::{ModelCapabilities, ModelCatalog, ModelDescriptor};
