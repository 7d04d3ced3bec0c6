//! Remote resolution: legacy importer id → target remote.
//!
//! Remotes are pre-migrated once per run from the legacy importer
//! definitions, then looked up through a run-scoped memoized resolver.
//! Importer cardinality is small and bounded, so the cache needs no
//! eviction.

use std::collections::HashMap;
use std::sync::Mutex;

use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::legacy::LegacyStore;
use crate::models::RemoteDescriptor;

/// Mirror legacy importers into the `remotes` table. Importers without a
/// feed URL have nothing to fetch from and are skipped. Conflict-ignore on
/// the importer id keeps reruns idempotent.
pub async fn pre_migrate_remotes(pool: &SqlitePool, legacy: &dyn LegacyStore) -> Result<u64> {
    let importers = legacy.importers().await?;
    let mut created = 0u64;
    for importer in importers {
        let Some(url) = importer.feed_url else {
            debug!(importer_id = %importer.importer_id, "importer has no feed URL, skipping");
            continue;
        };
        let result = sqlx::query(
            "INSERT OR IGNORE INTO remotes (id, importer_id, name, url) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&importer.importer_id)
        .bind(&importer.name)
        .bind(&url)
        .execute(pool)
        .await?;
        created += result.rows_affected();
    }
    Ok(created)
}

/// Memoized remote-by-importer lookup, shared read-only by all content
/// type pipelines within one run. Negative results are cached too.
pub struct RemoteResolver {
    pool: SqlitePool,
    cache: Mutex<HashMap<String, Option<RemoteDescriptor>>>,
}

impl RemoteResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, importer_id: &str) -> Result<Option<RemoteDescriptor>> {
        {
            let cache = self.cache.lock().expect("remote cache lock poisoned");
            if let Some(hit) = cache.get(importer_id) {
                return Ok(hit.clone());
            }
        }

        let row = sqlx::query("SELECT id, name, url FROM remotes WHERE importer_id = ?")
            .bind(importer_id)
            .fetch_optional(&self.pool)
            .await?;

        let remote = row.map(|r| RemoteDescriptor {
            id: r.get("id"),
            name: r.get("name"),
            url: r.get("url"),
        });

        let mut cache = self.cache.lock().expect("remote cache lock poisoned");
        cache.insert(importer_id.to_string(), remote.clone());
        Ok(remote)
    }
}
