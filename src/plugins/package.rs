//! The `package` content type: payload-bearing units identified by a
//! name/epoch/version/release/arch tuple plus checksum.

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::legacy::LegacyStore;
use crate::models::{CandidateContent, DetailRecord, LegacyContentRecord};
use crate::plugin::{ContentTypePlugin, PluginCapabilities};

pub struct PackagePlugin;

/// Type-specific fields of a legacy package document.
#[derive(Debug, Deserialize)]
struct PackageDoc {
    id: String,
    name: String,
    epoch: String,
    version: String,
    release: String,
    arch: String,
    checksum: String,
    checksum_type: String,
    #[serde(default)]
    size: Option<i64>,
    filename: String,
    #[serde(default)]
    is_modular: bool,
}

/// Typed view over a detail record's data document.
#[derive(Debug, Deserialize)]
struct PackageData {
    name: String,
    epoch: String,
    version: String,
    release: String,
    arch: String,
    checksum: String,
    checksum_type: String,
    #[serde(default)]
    size: Option<i64>,
    filename: String,
    #[serde(default)]
    is_modular: bool,
}

fn parse_data(detail: &DetailRecord) -> Option<PackageData> {
    serde_json::from_value(detail.data.clone()).ok()
}

fn natural_key(d: &PackageData) -> String {
    format!(
        "{}-{}:{}-{}.{}:{}:{}",
        d.name, d.epoch, d.version, d.release, d.arch, d.checksum_type, d.checksum
    )
}

#[async_trait]
impl ContentTypePlugin for PackagePlugin {
    fn content_type_id(&self) -> &'static str {
        "package"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            payload: true,
            relations: false,
        }
    }

    async fn ensure_schema(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS package_details (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                epoch TEXT NOT NULL,
                version TEXT NOT NULL,
                "release" TEXT NOT NULL,
                arch TEXT NOT NULL,
                checksum TEXT NOT NULL,
                checksum_type TEXT NOT NULL,
                size INTEGER,
                filename TEXT NOT NULL,
                is_modular INTEGER NOT NULL DEFAULT 0,
                legacy_content_id TEXT NOT NULL,
                UNIQUE(name, epoch, version, "release", arch, checksum_type, checksum,
                       legacy_content_id),
                FOREIGN KEY (legacy_content_id) REFERENCES legacy_content(id)
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn pre_migrate_detail(
        &self,
        pool: &SqlitePool,
        legacy: &dyn LegacyStore,
        batch: &[LegacyContentRecord],
    ) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        // One round trip for the whole batch; the id→record map and the
        // fetched documents are fully materialized (batch size bounds memory).
        let by_legacy_id: HashMap<&str, &LegacyContentRecord> =
            batch.iter().map(|r| (r.legacy_id.as_str(), r)).collect();
        let ids: Vec<String> = batch.iter().map(|r| r.legacy_id.clone()).collect();
        let docs = legacy.details_by_id(self.content_type_id(), &ids).await?;

        let mut inserted = 0u64;
        let mut tx = pool.begin().await?;
        for raw in docs {
            let doc: PackageDoc = serde_json::from_value(raw)
                .map_err(|e| MigrationError::Legacy(format!("malformed package document: {e}")))?;
            let Some(record) = by_legacy_id.get(doc.id.as_str()) else {
                continue;
            };
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO package_details
                    (id, name, epoch, version, "release", arch, checksum, checksum_type,
                     size, filename, is_modular, legacy_content_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&doc.name)
            .bind(&doc.epoch)
            .bind(&doc.version)
            .bind(&doc.release)
            .bind(&doc.arch)
            .bind(&doc.checksum)
            .bind(&doc.checksum_type)
            .bind(doc.size)
            .bind(&doc.filename)
            .bind(doc.is_modular)
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn load_pending_details(&self, pool: &SqlitePool) -> Result<Vec<DetailRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT d.name, d.epoch, d.version, d."release", d.arch,
                   d.checksum, d.checksum_type, d.size, d.filename, d.is_modular,
                   l.id AS l_id, l.legacy_id, l.content_type_id, l.last_updated,
                   l.storage_path, l.downloaded, l.content_unit_id
            FROM package_details d
            JOIN legacy_content l ON d.legacy_content_id = l.id
            WHERE l.content_unit_id IS NULL
            ORDER BY d.rowid
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mut details = Vec::with_capacity(rows.len());
        for row in rows {
            let data = serde_json::json!({
                "name": row.get::<String, _>("name"),
                "epoch": row.get::<String, _>("epoch"),
                "version": row.get::<String, _>("version"),
                "release": row.get::<String, _>("release"),
                "arch": row.get::<String, _>("arch"),
                "checksum": row.get::<String, _>("checksum"),
                "checksum_type": row.get::<String, _>("checksum_type"),
                "size": row.get::<Option<i64>, _>("size"),
                "filename": row.get::<String, _>("filename"),
                "is_modular": row.get::<bool, _>("is_modular"),
            });
            let parsed: PackageData = serde_json::from_value(data.clone())?;
            details.push(DetailRecord {
                legacy: LegacyContentRecord {
                    id: row.get("l_id"),
                    legacy_id: row.get("legacy_id"),
                    content_type_id: row.get("content_type_id"),
                    last_updated: row.get("last_updated"),
                    storage_path: row.get("storage_path"),
                    downloaded: row.get("downloaded"),
                    content_unit_id: row.get("content_unit_id"),
                },
                natural_key: natural_key(&parsed),
                data,
            });
        }
        Ok(details)
    }

    fn create_target_content(&self, detail: &DetailRecord) -> CandidateContent {
        CandidateContent {
            content_type_id: self.content_type_id().to_string(),
            natural_key: detail.natural_key.clone(),
            data: detail.data.clone(),
        }
    }

    fn expected_digests(&self, detail: &DetailRecord) -> BTreeMap<String, String> {
        let mut digests = BTreeMap::new();
        if let Some(d) = parse_data(detail) {
            digests.insert(d.checksum_type, d.checksum);
        }
        digests
    }

    fn expected_size(&self, detail: &DetailRecord) -> Option<i64> {
        parse_data(detail).and_then(|d| d.size)
    }

    fn relative_artifact_path(&self, detail: &DetailRecord) -> Option<String> {
        parse_data(detail).map(|d| d.filename)
    }
}
