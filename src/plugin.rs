//! Content-type plugin contract and registry.
//!
//! The pipeline engine depends only on this contract, never on a specific
//! type's internals. Plugins are registered explicitly in a static table
//! built once at process start; there is no runtime discovery.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{MigrationError, Result};
use crate::legacy::LegacyStore;
use crate::models::{CandidateContent, DetailRecord, LegacyContentRecord, MemberMatch};

/// What a plugin's content can do. Checked against the plugin's operations
/// when its pipeline runs; a payload-bearing type that cannot produce an
/// artifact path is a contract violation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginCapabilities {
    /// Units of this type carry a binary payload (artifacts exist).
    pub payload: bool,
    /// Units of this type reference members of another type by derived
    /// natural key (the interrelate stage applies).
    pub relations: bool,
}

/// Polymorphism contract every content type must implement.
#[async_trait]
pub trait ContentTypePlugin: Send + Sync {
    fn content_type_id(&self) -> &'static str;

    fn capabilities(&self) -> PluginCapabilities;

    /// Create this type's detail table(s). Must be idempotent.
    async fn ensure_schema(&self, pool: &SqlitePool) -> Result<()>;

    /// Map the type-specific legacy fields of a generic batch into detail
    /// records, with a conflict-ignore bulk insert. Safe to call repeatedly
    /// with overlapping batches. Returns the number of rows inserted.
    ///
    /// The whole batch is held in memory at once; batch size bounds memory.
    async fn pre_migrate_detail(
        &self,
        pool: &SqlitePool,
        legacy: &dyn LegacyStore,
        batch: &[LegacyContentRecord],
    ) -> Result<u64>;

    /// Load the detail records of all not-yet-migrated units of this type,
    /// in insertion order.
    async fn load_pending_details(&self, pool: &SqlitePool) -> Result<Vec<DetailRecord>>;

    /// Candidate target content for one detail record.
    fn create_target_content(&self, detail: &DetailRecord) -> CandidateContent;

    /// Expected payload digest set. Empty for types without payload.
    fn expected_digests(&self, _detail: &DetailRecord) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Expected payload size, when the legacy store recorded one.
    fn expected_size(&self, _detail: &DetailRecord) -> Option<i64> {
        None
    }

    /// Relative path of the unit's artifact inside the target store.
    /// Required whenever `capabilities().payload` is set.
    fn relative_artifact_path(&self, _detail: &DetailRecord) -> Option<String> {
        None
    }

    /// Member-matching tuples for composite units. Required whenever
    /// `capabilities().relations` is set.
    fn member_relations(&self, _detail: &DetailRecord) -> Option<MemberMatch> {
        None
    }
}

/// Static table of `{content type id → plugin}`, built once at startup.
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn ContentTypePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Registry pre-loaded with the built-in content types.
    pub fn built_in() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(crate::plugins::package::PackagePlugin))
            .expect("built-in plugin ids are unique");
        registry
            .register(Arc::new(crate::plugins::module::ModulePlugin))
            .expect("built-in plugin ids are unique");
        registry
    }

    /// Register a plugin. Duplicate or empty content type ids are rejected
    /// up front, before any pipeline starts.
    pub fn register(&mut self, plugin: Arc<dyn ContentTypePlugin>) -> Result<()> {
        let id = plugin.content_type_id();
        if id.is_empty() {
            return Err(MigrationError::MissingCapability {
                content_type: "<unnamed>".to_string(),
                capability: "content type id".to_string(),
            });
        }
        if self.get(id).is_some() {
            return Err(MigrationError::MissingCapability {
                content_type: id.to_string(),
                capability: "unique registration".to_string(),
            });
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn get(&self, content_type_id: &str) -> Option<Arc<dyn ContentTypePlugin>> {
        self.plugins
            .iter()
            .find(|p| p.content_type_id() == content_type_id)
            .cloned()
    }

    pub fn plugins(&self) -> &[Arc<dyn ContentTypePlugin>] {
        &self.plugins
    }

    pub fn content_type_ids(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.content_type_id()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_registry_has_package_and_module() {
        let registry = PluginRegistry::built_in();
        assert!(registry.get("package").is_some());
        assert!(registry.get("module").is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = PluginRegistry::built_in();
        let err = registry
            .register(Arc::new(crate::plugins::package::PackagePlugin))
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::MissingCapability { content_type, .. } if content_type == "package"
        ));
    }
}
