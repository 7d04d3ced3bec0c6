//! Read-only interface to the legacy document-oriented store.
//!
//! Connectivity to a live legacy deployment is out of scope; the migration
//! consumes a point-in-time JSON-lines export of the legacy collections
//! instead. Tests build a [`JsonExportStore`] directly from records.

use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{MigrationError, Result};
use crate::models::{LazyCatalogEntry, LegacyContentDoc, LegacyImporter};

/// Legacy store read interface.
#[async_trait]
pub trait LegacyStore: Send + Sync {
    /// Generic content documents of one type with `last_updated >= watermark`,
    /// ordered by `last_updated` ascending.
    async fn content_since(
        &self,
        content_type_id: &str,
        watermark: i64,
    ) -> Result<Vec<LegacyContentDoc>>;

    /// Full type-specific documents for the given legacy ids, fetched in
    /// one round trip.
    async fn details_by_id(
        &self,
        content_type_id: &str,
        ids: &[String],
    ) -> Result<Vec<serde_json::Value>>;

    /// All lazy catalog entries for one content type. The legacy store has
    /// no change tracking for these, so callers re-read them every run.
    async fn catalog_entries(&self, content_type_id: &str) -> Result<Vec<LazyCatalogEntry>>;

    /// All importer definitions.
    async fn importers(&self) -> Result<Vec<LegacyImporter>>;
}

/// Legacy store backed by a JSON-lines export directory:
/// `content.jsonl`, `catalog.jsonl`, `importers.jsonl`. The export is
/// loaded eagerly; this is sized for migration snapshots, not live data.
pub struct JsonExportStore {
    content: Vec<serde_json::Value>,
    catalog: Vec<LazyCatalogEntry>,
    importers: Vec<LegacyImporter>,
}

impl JsonExportStore {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            content: read_jsonl(&dir.join("content.jsonl"))?,
            catalog: read_jsonl(&dir.join("catalog.jsonl"))?,
            importers: read_jsonl(&dir.join("importers.jsonl"))?,
        })
    }

    /// Build a store from in-memory records. Content documents must carry
    /// at least the generic fields (`id`, `content_type_id`, `last_updated`).
    pub fn from_records(
        content: Vec<serde_json::Value>,
        catalog: Vec<LazyCatalogEntry>,
        importers: Vec<LegacyImporter>,
    ) -> Self {
        Self {
            content,
            catalog,
            importers,
        }
    }
}

/// Read one JSON document per line; a missing file is an empty collection.
fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

fn doc_type(doc: &serde_json::Value) -> Option<&str> {
    doc.get("content_type_id").and_then(|v| v.as_str())
}

#[async_trait]
impl LegacyStore for JsonExportStore {
    async fn content_since(
        &self,
        content_type_id: &str,
        watermark: i64,
    ) -> Result<Vec<LegacyContentDoc>> {
        let mut docs = Vec::new();
        for raw in &self.content {
            if doc_type(raw) != Some(content_type_id) {
                continue;
            }
            let doc: LegacyContentDoc = serde_json::from_value(raw.clone())
                .map_err(|e| MigrationError::Legacy(format!("malformed content document: {e}")))?;
            if doc.last_updated >= watermark {
                docs.push(doc);
            }
        }
        docs.sort_by_key(|d| d.last_updated);
        Ok(docs)
    }

    async fn details_by_id(
        &self,
        content_type_id: &str,
        ids: &[String],
    ) -> Result<Vec<serde_json::Value>> {
        let wanted: HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
        let docs = self
            .content
            .iter()
            .filter(|raw| doc_type(raw) == Some(content_type_id))
            .filter(|raw| {
                raw.get("id")
                    .and_then(|v| v.as_str())
                    .is_some_and(|id| wanted.contains(id))
            })
            .cloned()
            .collect();
        Ok(docs)
    }

    async fn catalog_entries(&self, content_type_id: &str) -> Result<Vec<LazyCatalogEntry>> {
        Ok(self
            .catalog
            .iter()
            .filter(|e| e.content_type_id == content_type_id)
            .cloned()
            .collect())
    }

    async fn importers(&self) -> Result<Vec<LegacyImporter>> {
        Ok(self.importers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> JsonExportStore {
        JsonExportStore::from_records(
            vec![
                json!({"id": "a", "content_type_id": "package", "last_updated": 5, "downloaded": true}),
                json!({"id": "b", "content_type_id": "package", "last_updated": 9}),
                json!({"id": "c", "content_type_id": "module", "last_updated": 3}),
            ],
            vec![],
            vec![],
        )
    }

    #[tokio::test]
    async fn content_since_filters_type_and_watermark() {
        let docs = store().content_since("package", 6).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "b");
        assert!(!docs[0].downloaded);
    }

    #[tokio::test]
    async fn content_since_is_inclusive_at_the_watermark() {
        let docs = store().content_since("package", 5).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "a");
    }

    #[tokio::test]
    async fn details_by_id_returns_full_documents() {
        let docs = store()
            .details_by_id("package", &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["downloaded"], json!(true));
    }
}
