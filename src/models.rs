//! Core data models used throughout Content Ferry.
//!
//! These types represent the legacy records, candidate artifacts, and
//! in-flight declarative units that flow through the extraction and
//! migration pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::future::ContentPromise;

/// Digest algorithms in preference order for picking the canonical digest
/// of an artifact.
const DIGEST_PREFERENCE: &[&str] = &["sha256", "sha512", "sha384", "sha224", "sha1", "md5"];

/// Generic legacy content record as mirrored into the target store.
///
/// Unique on `(legacy_id, content_type_id)`. `content_unit_id` is filled by
/// the relation-attachment stage once migration of the unit is complete; a
/// NULL value is what makes a record eligible for the next run.
#[derive(Debug, Clone)]
pub struct LegacyContentRecord {
    pub id: String,
    pub legacy_id: String,
    pub content_type_id: String,
    pub last_updated: i64,
    pub storage_path: Option<String>,
    pub downloaded: bool,
    pub content_unit_id: Option<String>,
}

/// Raw generic document as read from the legacy store.
///
/// Type-specific fields of the same document are fetched separately by the
/// detail pre-migrator; unknown fields are ignored on deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyContentDoc {
    pub id: String,
    pub content_type_id: String,
    pub last_updated: i64,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub downloaded: bool,
}

/// Legacy-side lazy catalog entry: maps a unit to a remote origin URL via
/// the importer that knows how to fetch it.
#[derive(Debug, Clone, Deserialize)]
pub struct LazyCatalogEntry {
    pub importer_id: String,
    pub unit_id: String,
    pub content_type_id: String,
    #[serde(default)]
    pub storage_path: Option<String>,
    pub url: String,
    #[serde(default)]
    pub revision: i64,
}

/// Legacy importer definition. Importers without a feed URL cannot become
/// remotes and are skipped during remote pre-migration.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyImporter {
    pub importer_id: String,
    pub name: String,
    #[serde(default)]
    pub feed_url: Option<String>,
}

/// Target-side remote endpoint configuration, resolved from a legacy
/// importer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// Content-addressed identity of a binary payload: a set of
/// `digest algorithm → hex value` pairs plus an optional size.
#[derive(Debug, Clone, Default)]
pub struct ArtifactDescriptor {
    pub digests: BTreeMap<String, String>,
    pub size: Option<i64>,
}

impl ArtifactDescriptor {
    /// The digest value used for dedup lookups, picked from the digest set
    /// by algorithm preference (sha256 first). `None` for an empty set.
    pub fn canonical_digest(&self) -> Option<&str> {
        for alg in DIGEST_PREFERENCE {
            if let Some(v) = self.digests.get(*alg) {
                return Some(v.as_str());
            }
        }
        // Unknown algorithm: fall back to the first entry so equal digest
        // sets still compare equal.
        self.digests.values().next().map(|v| v.as_str())
    }
}

/// Where a candidate artifact's bytes live.
#[derive(Debug, Clone)]
pub enum ArtifactSource {
    /// Present in legacy storage at this path.
    Local(PathBuf),
    /// Fetchable from a remote origin; `remote` is `None` when the
    /// importer could not be resolved but the bytes are already local.
    Remote {
        url: String,
        remote: Option<RemoteDescriptor>,
    },
}

/// Candidate artifact attached to an in-flight unit. `artifact_id` is
/// bound by the existence-check and saver stages.
#[derive(Debug, Clone)]
pub struct DeclarativeArtifact {
    pub descriptor: ArtifactDescriptor,
    pub source: ArtifactSource,
    pub relative_path: String,
    pub deferred: bool,
    pub artifact_id: Option<String>,
}

/// Candidate target content unit before persistence. Identity in the
/// target store is `(content_type_id, natural_key)`.
#[derive(Debug, Clone)]
pub struct CandidateContent {
    pub content_type_id: String,
    pub natural_key: String,
    pub data: serde_json::Value,
}

/// A member-matching tuple used by the relation builder: field name →
/// expected value, matched against the member unit's data document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberKey {
    pub fields: Vec<(String, serde_json::Value)>,
}

impl MemberKey {
    /// A stable string form used for first-encountered-wins dedup.
    pub fn dedup_key(&self) -> String {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        parts.join("/")
    }
}

/// References from a composite unit to member units of another content
/// type, by derived natural key rather than direct identity.
#[derive(Debug, Clone)]
pub struct MemberMatch {
    pub member_type_id: String,
    pub keys: Vec<MemberKey>,
}

/// Transient in-flight structure combining a candidate content unit, its
/// candidate artifacts, relation metadata, and the promise for its
/// eventual persisted identity. Exists only within one pipeline run.
#[derive(Debug)]
pub struct DeclarativeUnit {
    pub content: CandidateContent,
    pub artifacts: Vec<DeclarativeArtifact>,
    pub legacy: LegacyContentRecord,
    pub members: Option<MemberMatch>,
    pub promise: Option<ContentPromise>,
    pub content_unit_id: Option<String>,
}

/// Plugin-neutral detail record: the typed fields a content-type plugin
/// pre-migrated, carried as a JSON document the plugin itself knows how
/// to interpret.
#[derive(Debug, Clone)]
pub struct DetailRecord {
    pub legacy: LegacyContentRecord,
    pub natural_key: String,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_digest_prefers_sha256() {
        let mut d = ArtifactDescriptor::default();
        d.digests.insert("md5".into(), "aaa".into());
        d.digests.insert("sha512".into(), "ccc".into());
        d.digests.insert("sha256".into(), "bbb".into());
        assert_eq!(d.canonical_digest(), Some("bbb"));
    }

    #[test]
    fn canonical_digest_falls_back_to_any_entry() {
        let mut d = ArtifactDescriptor::default();
        d.digests.insert("blake2".into(), "xyz".into());
        assert_eq!(d.canonical_digest(), Some("xyz"));
        assert_eq!(ArtifactDescriptor::default().canonical_digest(), None);
    }

    #[test]
    fn member_key_dedup_key_is_stable() {
        let key = MemberKey {
            fields: vec![
                ("name".into(), json!("curl")),
                ("arch".into(), json!("x86_64")),
            ],
        };
        assert_eq!(key.dedup_key(), "name=\"curl\"/arch=\"x86_64\"");
    }
}
