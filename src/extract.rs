//! Incremental, resumable extraction from the legacy store.
//!
//! For each content type: read generic records above the stored watermark,
//! mirror them into `legacy_content` with conflict-ignore semantics, and
//! hand each batch to the type's detail pre-migrator. Records sitting
//! exactly on the watermark may have been migrated by a prior run; those
//! are excluded with a negative progress correction instead of being
//! reprocessed. Finally the type's lazy catalog is rebuilt wholesale,
//! since the legacy store cannot tell us whether catalog entries changed.

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::legacy::LegacyStore;
use crate::models::{LegacyContentDoc, LegacyContentRecord};
use crate::plugin::ContentTypePlugin;
use crate::progress::{ProgressCounter, ProgressReporter};

/// Counters for one content type's extraction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionOutcome {
    /// Items this run was responsible for, after boundary corrections.
    pub total: u64,
    /// Items mirrored (or re-confirmed) into the target-side generic table.
    pub done: u64,
    /// Boundary duplicates excluded from reprocessing.
    pub excluded: u64,
}

pub async fn pre_migrate_type(
    pool: &SqlitePool,
    legacy: &dyn LegacyStore,
    plugin: &dyn ContentTypePlugin,
    batch_size: usize,
    reporter: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<ExtractionOutcome> {
    let content_type = plugin.content_type_id();

    let watermark: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(last_updated), 0) FROM legacy_content WHERE content_type_id = ?",
    )
    .bind(content_type)
    .fetch_one(pool)
    .await?;
    debug!(content_type, watermark, "resuming extraction");

    let docs = legacy.content_since(content_type, watermark).await?;
    let mut counter =
        ProgressCounter::start(reporter, format!("pre-migrate {content_type}"), docs.len() as u64);
    let mut outcome = ExtractionOutcome::default();

    for chunk in docs.chunks(batch_size.max(1)) {
        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }

        let mut batch: Vec<LegacyContentRecord> = Vec::with_capacity(chunk.len());
        for doc in chunk {
            // Boundary duplicate: content bearing the exact watermark
            // timestamp may already be there from the previous run.
            if doc.last_updated == watermark && already_mirrored(pool, doc).await? {
                outcome.excluded += 1;
                counter.deduct(1);
                continue;
            }
            batch.push(LegacyContentRecord {
                id: Uuid::new_v4().to_string(),
                legacy_id: doc.id.clone(),
                content_type_id: doc.content_type_id.clone(),
                last_updated: doc.last_updated,
                storage_path: doc.storage_path.clone(),
                downloaded: doc.downloaded,
                content_unit_id: None,
            });
        }
        if batch.is_empty() {
            continue;
        }

        insert_generic_batch(pool, &batch).await?;
        // Re-read by unique key: rows that survived a conflict keep their
        // original target-side ids, and the detail pre-migrator needs those.
        let stored = fetch_generic_rows(pool, content_type, &batch).await?;
        plugin.pre_migrate_detail(pool, legacy, &stored).await?;

        debug!(
            content_type,
            saved = stored.len(),
            "bulk save for generic content info"
        );
        counter.advance(stored.len() as u64);
        outcome.done += stored.len() as u64;
    }

    pre_migrate_lazy_catalog(pool, legacy, content_type).await?;

    counter.finish();
    outcome.total = counter.total();
    Ok(outcome)
}

async fn already_mirrored(pool: &SqlitePool, doc: &LegacyContentDoc) -> Result<bool> {
    let hit: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM legacy_content WHERE legacy_id = ? AND content_type_id = ? AND last_updated = ?",
    )
    .bind(&doc.id)
    .bind(&doc.content_type_id)
    .bind(doc.last_updated)
    .fetch_optional(pool)
    .await?;
    Ok(hit.is_some())
}

/// Conflict-ignore bulk insert: a duplicate (legacy_id, content_type_id)
/// is a no-op, not an error. This is what makes reruns idempotent.
async fn insert_generic_batch(pool: &SqlitePool, batch: &[LegacyContentRecord]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for record in batch {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO legacy_content
                (id, legacy_id, content_type_id, last_updated, storage_path, downloaded)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.legacy_id)
        .bind(&record.content_type_id)
        .bind(record.last_updated)
        .bind(&record.storage_path)
        .bind(record.downloaded)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn fetch_generic_rows(
    pool: &SqlitePool,
    content_type: &str,
    batch: &[LegacyContentRecord],
) -> Result<Vec<LegacyContentRecord>> {
    use sqlx::Row;

    let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
        "SELECT id, legacy_id, content_type_id, last_updated, storage_path, downloaded, \
         content_unit_id FROM legacy_content WHERE content_type_id = ",
    );
    qb.push_bind(content_type);
    qb.push(" AND legacy_id IN (");
    let mut sep = qb.separated(", ");
    for record in batch {
        sep.push_bind(record.legacy_id.as_str());
    }
    qb.push(") ORDER BY rowid");

    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| LegacyContentRecord {
            id: row.get("id"),
            legacy_id: row.get("legacy_id"),
            content_type_id: row.get("content_type_id"),
            last_updated: row.get("last_updated"),
            storage_path: row.get("storage_path"),
            downloaded: row.get("downloaded"),
            content_unit_id: row.get("content_unit_id"),
        })
        .collect())
}

/// Delete and re-create the lazy catalog rows for one content type.
async fn pre_migrate_lazy_catalog(
    pool: &SqlitePool,
    legacy: &dyn LegacyStore,
    content_type: &str,
) -> Result<()> {
    let entries = legacy.catalog_entries(content_type).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM lazy_catalog WHERE content_type_id = ?")
        .bind(content_type)
        .execute(&mut *tx)
        .await?;
    for entry in &entries {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO lazy_catalog
                (id, importer_id, legacy_unit_id, content_type_id, storage_path, url, revision)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&entry.importer_id)
        .bind(&entry.unit_id)
        .bind(&entry.content_type_id)
        .bind(&entry.storage_path)
        .bind(&entry.url)
        .bind(entry.revision)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    debug!(content_type, count = entries.len(), "lazy catalog rebuilt");
    Ok(())
}
