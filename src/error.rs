//! Error taxonomy for the migration library.
//!
//! Per-unit conditions ([`MigrationError::SkippedContent`],
//! [`MigrationError::UnresolvedRemote`]) are recovered locally in the
//! pipeline (warn + skip counter); everything else propagates and aborts
//! the affected content type's pipeline, never its siblings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// On-demand content with no way to fetch it later. Non-fatal.
    #[error("content unit {legacy_id} is not downloaded and has no lazy catalog entry")]
    SkippedContent { legacy_id: String },

    /// An importer id with no mapped remote. Non-fatal per unit.
    #[error("no remote is mapped for importer {importer_id}")]
    UnresolvedRemote { importer_id: String },

    /// A content type named in the plan has no usable plugin. Fatal for
    /// that type before its pipeline starts.
    #[error("content type {content_type} is missing a required capability: {capability}")]
    MissingCapability {
        content_type: String,
        capability: String,
    },

    /// The interrelate batch transaction failed and was rolled back.
    /// Safe to retry by rerunning the migration.
    #[error("relation batch transaction failed")]
    RelationTransaction(#[source] sqlx::Error),

    /// The run was cancelled; in-flight stages bail at their next
    /// suspension point and unresolved content futures fail with this.
    #[error("migration run cancelled")]
    Cancelled,

    /// A stage task panicked or was aborted out from under the engine.
    #[error("pipeline stage failed: {0}")]
    Stage(String),

    #[error("legacy store error: {0}")]
    Legacy(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MigrationError>;
