//! The `module` content type: pure-relational composite units that
//! reference member packages by a descriptive attribute tuple instead of
//! a direct identity.

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::legacy::LegacyStore;
use crate::models::{
    CandidateContent, DetailRecord, LegacyContentRecord, MemberKey, MemberMatch,
};
use crate::plugin::{ContentTypePlugin, PluginCapabilities};

pub struct ModulePlugin;

/// A member reference by package attributes (no checksum: two packages may
/// share one tuple).
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct MemberRef {
    name: String,
    epoch: String,
    version: String,
    release: String,
    arch: String,
}

#[derive(Debug, Deserialize)]
struct ModuleDoc {
    id: String,
    name: String,
    stream: String,
    #[serde(default)]
    members: Vec<MemberRef>,
}

#[async_trait]
impl ContentTypePlugin for ModulePlugin {
    fn content_type_id(&self) -> &'static str {
        "module"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            payload: false,
            relations: true,
        }
    }

    async fn ensure_schema(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS module_details (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                stream TEXT NOT NULL,
                members_json TEXT NOT NULL DEFAULT '[]',
                legacy_content_id TEXT NOT NULL,
                UNIQUE(name, stream, legacy_content_id),
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

        let by_legacy_id: HashMap<&str, &LegacyContentRecord> =
            batch.iter().map(|r| (r.legacy_id.as_str(), r)).collect();
        let ids: Vec<String> = batch.iter().map(|r| r.legacy_id.clone()).collect();
        let docs = legacy.details_by_id(self.content_type_id(), &ids).await?;

        let mut inserted = 0u64;
        let mut tx = pool.begin().await?;
        for raw in docs {
            let doc: ModuleDoc = serde_json::from_value(raw)
                .map_err(|e| MigrationError::Legacy(format!("malformed module document: {e}")))?;
            let Some(record) = by_legacy_id.get(doc.id.as_str()) else {
                continue;
            };
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO module_details
                    (id, name, stream, members_json, legacy_content_id)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&doc.name)
            .bind(&doc.stream)
            .bind(serde_json::to_string(&doc.members)?)
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
            SELECT d.name, d.stream, d.members_json,
                   l.id AS l_id, l.legacy_id, l.content_type_id, l.last_updated,
                   l.storage_path, l.downloaded, l.content_unit_id
            FROM module_details d
            JOIN legacy_content l ON d.legacy_content_id = l.id
            WHERE l.content_unit_id IS NULL
            ORDER BY d.rowid
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mut details = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("name");
            let stream: String = row.get("stream");
            let members: serde_json::Value =
                serde_json::from_str(&row.get::<String, _>("members_json"))?;
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
                natural_key: format!("{name}:{stream}"),
                data: serde_json::json!({
                    "name": name,
                    "stream": stream,
                    "members": members,
                }),
            });
        }
        Ok(details)
    }

    fn create_target_content(&self, detail: &DetailRecord) -> CandidateContent {
        // Member refs stay out of the persisted unit; they only drive the
        // interrelate stage.
        let data = serde_json::json!({
            "name": detail.data.get("name").cloned().unwrap_or_default(),
            "stream": detail.data.get("stream").cloned().unwrap_or_default(),
        });
        CandidateContent {
            content_type_id: self.content_type_id().to_string(),
            natural_key: detail.natural_key.clone(),
            data,
        }
    }

    fn member_relations(&self, detail: &DetailRecord) -> Option<MemberMatch> {
        let members: Vec<MemberRef> = detail
            .data
            .get("members")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        if members.is_empty() {
            return None;
        }
        let keys = members
            .into_iter()
            .map(|m| MemberKey {
                fields: vec![
                    ("name".to_string(), serde_json::json!(m.name)),
                    ("epoch".to_string(), serde_json::json!(m.epoch)),
                    ("version".to_string(), serde_json::json!(m.version)),
                    ("release".to_string(), serde_json::json!(m.release)),
                    ("arch".to_string(), serde_json::json!(m.arch)),
                    ("is_modular".to_string(), serde_json::json!(true)),
                ],
            })
            .collect();
        Some(MemberMatch {
            member_type_id: "package".to_string(),
            keys,
        })
    }
}
