//! Idempotent target-store schema creation.
//!
//! Core tables belong to the engine; detail tables belong to the
//! content-type plugins and are created through their `ensure_schema` hook.

use sqlx::SqlitePool;

use crate::error::Result;
use crate::plugin::PluginRegistry;

pub async fn create_schema(pool: &SqlitePool, registry: &PluginRegistry) -> Result<()> {
    // Generic legacy content mirror. A NULL content_unit_id marks a record
    // as not yet migrated.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS legacy_content (
            id TEXT PRIMARY KEY,
            legacy_id TEXT NOT NULL,
            content_type_id TEXT NOT NULL,
            last_updated INTEGER NOT NULL,
            storage_path TEXT,
            downloaded INTEGER NOT NULL DEFAULT 0,
            content_unit_id TEXT,
            UNIQUE(legacy_id, content_type_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Lazy catalog entries, rebuilt wholesale per content type on each run.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lazy_catalog (
            id TEXT PRIMARY KEY,
            importer_id TEXT NOT NULL,
            legacy_unit_id TEXT NOT NULL,
            content_type_id TEXT NOT NULL,
            storage_path TEXT,
            url TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Remotes resolved from legacy importers.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS remotes (
            id TEXT PRIMARY KEY,
            importer_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            url TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Content-addressed artifacts. The canonical digest is the dedup point:
    // two descriptors with equal digest sets resolve to one row here.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            digest TEXT NOT NULL UNIQUE,
            digests_json TEXT NOT NULL DEFAULT '{}',
            size INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_units (
            id TEXT PRIMARY KEY,
            content_type_id TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            data_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(content_type_id, natural_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Unit→artifact linkage. artifact_id is NULL for deferred-only content
    // whose bytes were never local.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_artifacts (
            content_unit_id TEXT NOT NULL,
            artifact_id TEXT,
            relative_path TEXT NOT NULL,
            UNIQUE(content_unit_id, relative_path),
            FOREIGN KEY (content_unit_id) REFERENCES content_units(id),
            FOREIGN KEY (artifact_id) REFERENCES artifacts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Remote-origin linkage, persisted separately from artifact bytes.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS remote_artifacts (
            content_unit_id TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            url TEXT NOT NULL,
            remote_id TEXT NOT NULL,
            deferred INTEGER NOT NULL DEFAULT 0,
            UNIQUE(content_unit_id, url),
            FOREIGN KEY (content_unit_id) REFERENCES content_units(id),
            FOREIGN KEY (remote_id) REFERENCES remotes(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Composite→member associations built by the relation stage.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_relations (
            parent_id TEXT NOT NULL,
            child_id TEXT NOT NULL,
            UNIQUE(parent_id, child_id),
            FOREIGN KEY (parent_id) REFERENCES content_units(id),
            FOREIGN KEY (child_id) REFERENCES content_units(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_legacy_content_type_updated \
         ON legacy_content(content_type_id, last_updated)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_legacy_content_pending \
         ON legacy_content(content_type_id) WHERE content_unit_id IS NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_lazy_catalog_unit \
         ON lazy_catalog(content_type_id, legacy_unit_id)",
    )
    .execute(pool)
    .await?;

    for plugin in registry.plugins() {
        plugin.ensure_schema(pool).await?;
    }

    Ok(())
}
