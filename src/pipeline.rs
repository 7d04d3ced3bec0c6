//! Staged, concurrent migration pipeline for one content type.
//!
//! Stages run as tokio tasks connected by bounded channels, so a slow
//! database never lets an unbounded number of in-flight units pile up.
//! Ordering within a stage follows arrival order; dedup relies on the
//! conflict-ignore inserts underneath, not on ordering guarantees.
//!
//! Stage order mirrors the data dependencies: artifacts must exist before
//! content rows can link them, content rows must exist before remote
//! linkage and relations, and the legacy mirror is stamped last so a
//! crash mid-run re-processes rather than orphans.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::future::{content_future, FutureBook};
use crate::models::{
    ArtifactDescriptor, ArtifactSource, DeclarativeArtifact, DeclarativeUnit, DetailRecord,
};
use crate::plugin::ContentTypePlugin;
use crate::progress::{ProgressCounter, ProgressReporter};
use crate::relate;
use crate::remotes::RemoteResolver;

/// Shared dependencies of every stage in a run.
#[derive(Clone)]
pub struct PipelineContext {
    pub pool: SqlitePool,
    pub resolver: Arc<RemoteResolver>,
    pub futures: Arc<FutureBook>,
    pub cancel: CancellationToken,
    pub queue_depth: usize,
    pub batch_size: usize,
}

/// Final tally for one content type's pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOutcome {
    pub migrated: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct StageCounters {
    skipped: AtomicU64,
}

/// Run the full stage chain for one content type and drain it to
/// completion. The caller decides ordering across types.
pub async fn run_type_pipeline(
    ctx: &PipelineContext,
    plugin: Arc<dyn ContentTypePlugin>,
    reporter: &dyn ProgressReporter,
) -> Result<PipelineOutcome> {
    let details = plugin.load_pending_details(&ctx.pool).await?;
    let content_type = plugin.content_type_id();
    debug!(content_type, pending = details.len(), "pipeline starting");

    // A payload-bearing plugin that cannot name an artifact path violates
    // its declared capabilities. Fail the type here, before any stage
    // spawns, rather than mid-stream.
    if plugin.capabilities().payload {
        if let Some(detail) = details.first() {
            if plugin.relative_artifact_path(detail).is_none() {
                return Err(MigrationError::MissingCapability {
                    content_type: content_type.to_string(),
                    capability: "relative artifact path".to_string(),
                });
            }
        }
    }

    let mut counter = ProgressCounter::start(
        reporter,
        format!("migrate {content_type}"),
        details.len() as u64,
    );
    let counters = Arc::new(StageCounters::default());

    let depth = ctx.queue_depth.max(1);
    let (gen_tx, gen_rx) = mpsc::channel(depth);
    let (qa_tx, qa_rx) = mpsc::channel(depth);
    let (as_tx, as_rx) = mpsc::channel(depth);
    let (qc_tx, qc_rx) = mpsc::channel(depth);
    let (cs_tx, cs_rx) = mpsc::channel(depth);
    let (ra_tx, ra_rx) = mpsc::channel(depth);
    let (ir_tx, ir_rx) = mpsc::channel(depth);
    let (rl_tx, mut rl_rx) = mpsc::channel::<DeclarativeUnit>(depth);

    let mut stages: JoinSet<Result<()>> = JoinSet::new();
    stages.spawn(generate_stage(
        ctx.clone(),
        plugin.clone(),
        details,
        counters.clone(),
        gen_tx,
    ));
    stages.spawn(query_existing_artifacts(
        ctx.clone(),
        counters.clone(),
        gen_rx,
        qa_tx,
    ));
    stages.spawn(artifact_saver(ctx.clone(), qa_rx, as_tx));
    stages.spawn(query_existing_content(ctx.clone(), as_rx, qc_tx));
    stages.spawn(content_saver(ctx.clone(), qc_rx, cs_tx));
    stages.spawn(remote_artifact_saver(ctx.clone(), cs_rx, ra_tx));
    stages.spawn(interrelate_stage(ctx.clone(), ra_rx, ir_tx));
    stages.spawn(relate_legacy_stage(ctx.clone(), ir_rx, rl_tx));

    // Final stage runs inline: resolve each record's content future. The
    // promise was fulfilled by the content saver; the handle is claimed
    // here. One legacy record may fan out into several units, and the
    // handle is single-consumer, so the record counts once, and only when
    // its future resolved to a persisted identity.
    let mut outcome = PipelineOutcome::default();
    while let Some(unit) = rl_rx.recv().await {
        if unit.content_unit_id.is_none() {
            return Err(MigrationError::Stage(
                "unit reached resolver unsaved".to_string(),
            ));
        }
        if let Some(handle) = ctx
            .futures
            .claim(&unit.legacy.content_type_id, &unit.legacy.legacy_id)
        {
            if handle.get().await.is_ok() {
                outcome.migrated += 1;
                counter.advance(1);
            }
        }
    }

    // A stage that died because a neighbor closed its channel is a
    // symptom; keep the most specific error seen across the chain.
    let mut failure: Option<MigrationError> = None;
    while let Some(joined) = stages.join_next().await {
        let err = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(join_err) => MigrationError::Stage(join_err.to_string()),
        };
        match &failure {
            None => failure = Some(err),
            Some(MigrationError::Stage(_)) if !matches!(err, MigrationError::Stage(_)) => {
                failure = Some(err)
            }
            _ => {}
        }
    }
    if let Some(err) = failure {
        return Err(err);
    }

    outcome.skipped = counters.skipped.load(Ordering::Relaxed);
    counter.deduct(outcome.skipped);
    counter.finish();
    debug!(
        content_type,
        migrated = outcome.migrated,
        skipped = outcome.skipped,
        "pipeline finished"
    );
    Ok(outcome)
}

/// Receive one unit, then drain whatever else is immediately ready, up
/// to `max`. Keeps stages batch-oriented without waiting for full loads.
async fn next_batch<T>(rx: &mut mpsc::Receiver<T>, max: usize) -> Option<Vec<T>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    while batch.len() < max {
        match rx.try_recv() {
            Ok(item) => batch.push(item),
            Err(_) => break,
        }
    }
    Some(batch)
}

async fn put(tx: &mpsc::Sender<DeclarativeUnit>, unit: DeclarativeUnit) -> Result<()> {
    tx.send(unit)
        .await
        .map_err(|_| MigrationError::Stage("downstream stage closed".to_string()))
}

/// First stage: turn pending detail records into in-flight units per the
/// generation policy. Payload-free types yield one bare unit per record.
/// Payload types yield one unit per lazy catalog entry, or a single unit
/// backed by legacy storage when no catalog entry exists. Records that
/// can produce no unit at all are skipped, once each.
async fn generate_stage(
    ctx: PipelineContext,
    plugin: Arc<dyn ContentTypePlugin>,
    details: Vec<DetailRecord>,
    counters: Arc<StageCounters>,
    tx: mpsc::Sender<DeclarativeUnit>,
) -> Result<()> {
    let caps = plugin.capabilities();
    for detail in details {
        if ctx.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }

        let content = plugin.create_target_content(&detail);
        let members = plugin.member_relations(&detail);
        let (promise, handle) = content_future();
        ctx.futures
            .register(&detail.legacy.content_type_id, &detail.legacy.legacy_id, handle);
        let mut promise = Some(promise);

        if !caps.payload {
            let unit = DeclarativeUnit {
                content,
                artifacts: Vec::new(),
                legacy: detail.legacy.clone(),
                members,
                promise: promise.take(),
                content_unit_id: None,
            };
            put(&tx, unit).await?;
            continue;
        }

        let relative_path = plugin.relative_artifact_path(&detail).ok_or_else(|| {
            MigrationError::MissingCapability {
                content_type: plugin.content_type_id().to_string(),
                capability: "relative artifact path".to_string(),
            }
        })?;
        let descriptor = ArtifactDescriptor {
            digests: plugin.expected_digests(&detail),
            size: plugin.expected_size(&detail),
        };

        let entries = catalog_entries_for(&ctx.pool, &detail.legacy).await?;
        let mut emitted = 0usize;
        for (importer_id, url) in entries {
            let remote = ctx.resolver.resolve(&importer_id).await?;
            if remote.is_none() && !detail.legacy.downloaded {
                warn!(
                    legacy_id = %detail.legacy.legacy_id,
                    %importer_id, "no remote for deferred content, cannot migrate"
                );
                continue;
            }
            let unit = DeclarativeUnit {
                content: content.clone(),
                artifacts: vec![DeclarativeArtifact {
                    descriptor: descriptor.clone(),
                    source: ArtifactSource::Remote { url, remote },
                    relative_path: relative_path.clone(),
                    deferred: !detail.legacy.downloaded,
                    artifact_id: None,
                }],
                legacy: detail.legacy.clone(),
                members: members.clone(),
                promise: promise.take(),
                content_unit_id: None,
            };
            put(&tx, unit).await?;
            emitted += 1;
        }

        if emitted == 0 {
            match (&detail.legacy.storage_path, detail.legacy.downloaded) {
                (Some(path), true) => {
                    let unit = DeclarativeUnit {
                        content,
                        artifacts: vec![DeclarativeArtifact {
                            descriptor,
                            source: ArtifactSource::Local(PathBuf::from(path)),
                            relative_path,
                            deferred: false,
                            artifact_id: None,
                        }],
                        legacy: detail.legacy.clone(),
                        members,
                        promise: promise.take(),
                        content_unit_id: None,
                    };
                    put(&tx, unit).await?;
                }
                _ => {
                    warn!(
                        legacy_id = %detail.legacy.legacy_id,
                        "not downloaded and no catalog entry, skipping"
                    );
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
    Ok(())
}

/// Catalog entries for one legacy unit, newest revision first and one
/// per importer.
async fn catalog_entries_for(
    pool: &SqlitePool,
    legacy: &crate::models::LegacyContentRecord,
) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        r#"
        SELECT importer_id, url FROM lazy_catalog
        WHERE content_type_id = ? AND legacy_unit_id = ?
        ORDER BY revision DESC, rowid
        "#,
    )
    .bind(&legacy.content_type_id)
    .bind(&legacy.legacy_id)
    .fetch_all(pool)
    .await?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for row in rows {
        let importer_id: String = row.get("importer_id");
        if seen.insert(importer_id.clone()) {
            entries.push((importer_id, row.get("url")));
        }
    }
    Ok(entries)
}

/// Bind already-persisted artifact rows to in-flight artifacts by digest,
/// computing missing digests from legacy storage first. A unit whose
/// payload bytes cannot be identified is skipped, not failed: one
/// unreadable file should not abort a whole type.
async fn query_existing_artifacts(
    ctx: PipelineContext,
    counters: Arc<StageCounters>,
    mut rx: mpsc::Receiver<DeclarativeUnit>,
    tx: mpsc::Sender<DeclarativeUnit>,
) -> Result<()> {
    while let Some(batch) = next_batch(&mut rx, ctx.batch_size).await {
        if ctx.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        let mut ready = Vec::with_capacity(batch.len());
        'units: for mut unit in batch {
            for artifact in &mut unit.artifacts {
                if artifact.descriptor.digests.is_empty() && !artifact.deferred {
                    match digest_for(artifact, &unit.legacy.storage_path).await {
                        Some((digest, size)) => {
                            artifact.descriptor.digests.insert("sha256".to_string(), digest);
                            if artifact.descriptor.size.is_none() {
                                artifact.descriptor.size = Some(size);
                            }
                        }
                        None => {
                            warn!(
                                legacy_id = %unit.legacy.legacy_id,
                                "payload unreadable and no digest recorded, skipping"
                            );
                            counters.skipped.fetch_add(1, Ordering::Relaxed);
                            continue 'units;
                        }
                    }
                }
            }
            ready.push(unit);
        }

        let digests: Vec<String> = ready
            .iter()
            .flat_map(|u| u.artifacts.iter())
            .filter_map(|a| a.descriptor.canonical_digest().map(str::to_string))
            .collect();
        let existing = existing_artifacts_by_digest(&ctx.pool, &digests).await?;

        for mut unit in ready {
            for artifact in &mut unit.artifacts {
                if let Some(digest) = artifact.descriptor.canonical_digest() {
                    if let Some(id) = existing.get(digest) {
                        artifact.artifact_id = Some(id.clone());
                    }
                }
            }
            put(&tx, unit).await?;
        }
    }
    Ok(())
}

async fn digest_for(
    artifact: &DeclarativeArtifact,
    storage_path: &Option<String>,
) -> Option<(String, i64)> {
    let path = match &artifact.source {
        ArtifactSource::Local(path) => path.clone(),
        ArtifactSource::Remote { .. } => PathBuf::from(storage_path.as_deref()?),
    };
    let bytes = tokio::fs::read(&path).await.ok()?;
    let digest = hex::encode(Sha256::digest(&bytes));
    Some((digest, bytes.len() as i64))
}

async fn existing_artifacts_by_digest(
    pool: &SqlitePool,
    digests: &[String],
) -> Result<HashMap<String, String>> {
    if digests.is_empty() {
        return Ok(HashMap::new());
    }
    let mut qb =
        sqlx::QueryBuilder::<sqlx::Sqlite>::new("SELECT id, digest FROM artifacts WHERE digest IN (");
    let mut sep = qb.separated(", ");
    for digest in digests {
        sep.push_bind(digest.as_str());
    }
    qb.push(")");
    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get("digest"), row.get("id")))
        .collect())
}

/// Persist artifact rows for non-deferred artifacts that the existence
/// check left unbound. The digest column is unique, so a concurrent or
/// previous insert of the same payload collapses to one row.
async fn artifact_saver(
    ctx: PipelineContext,
    mut rx: mpsc::Receiver<DeclarativeUnit>,
    tx: mpsc::Sender<DeclarativeUnit>,
) -> Result<()> {
    while let Some(batch) = next_batch(&mut rx, ctx.batch_size).await {
        if ctx.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        let mut tx_db = ctx.pool.begin().await?;
        let mut pending: Vec<String> = Vec::new();
        for unit in &batch {
            for artifact in &unit.artifacts {
                if artifact.deferred || artifact.artifact_id.is_some() {
                    continue;
                }
                let Some(digest) = artifact.descriptor.canonical_digest() else {
                    continue;
                };
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO artifacts (id, digest, digests_json, size)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(digest)
                .bind(serde_json::to_string(&artifact.descriptor.digests)?)
                .bind(artifact.descriptor.size)
                .execute(&mut *tx_db)
                .await?;
                pending.push(digest.to_string());
            }
        }
        tx_db.commit().await?;

        let stored = existing_artifacts_by_digest(&ctx.pool, &pending).await?;
        for mut unit in batch {
            for artifact in &mut unit.artifacts {
                if artifact.artifact_id.is_none() {
                    if let Some(digest) = artifact.descriptor.canonical_digest() {
                        artifact.artifact_id = stored.get(digest).cloned();
                    }
                }
            }
            put(&tx, unit).await?;
        }
    }
    Ok(())
}

/// Bind already-persisted content rows by `(content type, natural key)`.
async fn query_existing_content(
    ctx: PipelineContext,
    mut rx: mpsc::Receiver<DeclarativeUnit>,
    tx: mpsc::Sender<DeclarativeUnit>,
) -> Result<()> {
    while let Some(batch) = next_batch(&mut rx, ctx.batch_size).await {
        if ctx.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        let keys: Vec<(String, String)> = batch
            .iter()
            .map(|u| (u.content.content_type_id.clone(), u.content.natural_key.clone()))
            .collect();
        let existing = existing_content_by_key(&ctx.pool, &keys).await?;
        for mut unit in batch {
            unit.content_unit_id = existing
                .get(&(
                    unit.content.content_type_id.clone(),
                    unit.content.natural_key.clone(),
                ))
                .cloned();
            put(&tx, unit).await?;
        }
    }
    Ok(())
}

async fn existing_content_by_key(
    pool: &SqlitePool,
    keys: &[(String, String)],
) -> Result<HashMap<(String, String), String>> {
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
        "SELECT id, content_type_id, natural_key FROM content_units WHERE ",
    );
    for (i, (type_id, natural_key)) in keys.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push("(content_type_id = ");
        qb.push_bind(type_id.as_str());
        qb.push(" AND natural_key = ");
        qb.push_bind(natural_key.as_str());
        qb.push(")");
    }
    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            (
                (row.get("content_type_id"), row.get("natural_key")),
                row.get("id"),
            )
        })
        .collect())
}

/// Persist unbound content rows and their artifact linkage. The natural
/// key is unique, so duplicate candidates within or across runs collapse
/// to the first persisted row, which keeps its original attributes.
async fn content_saver(
    ctx: PipelineContext,
    mut rx: mpsc::Receiver<DeclarativeUnit>,
    tx: mpsc::Sender<DeclarativeUnit>,
) -> Result<()> {
    while let Some(batch) = next_batch(&mut rx, ctx.batch_size).await {
        if ctx.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        let mut tx_db = ctx.pool.begin().await?;
        for unit in &batch {
            if unit.content_unit_id.is_none() {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO content_units (id, content_type_id, natural_key, data_json)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&unit.content.content_type_id)
                .bind(&unit.content.natural_key)
                .bind(serde_json::to_string(&unit.content.data)?)
                .execute(&mut *tx_db)
                .await?;
            }
        }
        tx_db.commit().await?;

        let keys: Vec<(String, String)> = batch
            .iter()
            .map(|u| (u.content.content_type_id.clone(), u.content.natural_key.clone()))
            .collect();
        let stored = existing_content_by_key(&ctx.pool, &keys).await?;

        let mut tx_db = ctx.pool.begin().await?;
        let mut ready = Vec::with_capacity(batch.len());
        for mut unit in batch {
            let key = (
                unit.content.content_type_id.clone(),
                unit.content.natural_key.clone(),
            );
            let unit_id = stored.get(&key).cloned().ok_or_else(|| {
                MigrationError::Stage(format!("content row vanished for {}", unit.content.natural_key))
            })?;
            for artifact in &unit.artifacts {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO content_artifacts (content_unit_id, artifact_id, relative_path)
                    VALUES (?, ?, ?)
                    "#,
                )
                .bind(&unit_id)
                .bind(&artifact.artifact_id)
                .bind(&artifact.relative_path)
                .execute(&mut *tx_db)
                .await?;
            }
            unit.content_unit_id = Some(unit_id);
            ready.push(unit);
        }
        tx_db.commit().await?;

        for mut unit in ready {
            // The unit is durably persisted; anyone holding the matching
            // handle may now learn its identity.
            if let Some(promise) = unit.promise.take() {
                if let Some(unit_id) = &unit.content_unit_id {
                    promise.fulfill(unit_id.clone());
                }
            }
            put(&tx, unit).await?;
        }
    }
    Ok(())
}

/// Persist remote-origin linkage for artifacts carrying a resolved remote.
async fn remote_artifact_saver(
    ctx: PipelineContext,
    mut rx: mpsc::Receiver<DeclarativeUnit>,
    tx: mpsc::Sender<DeclarativeUnit>,
) -> Result<()> {
    while let Some(batch) = next_batch(&mut rx, ctx.batch_size).await {
        if ctx.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        let mut tx_db = ctx.pool.begin().await?;
        for unit in &batch {
            let Some(unit_id) = &unit.content_unit_id else {
                continue;
            };
            for artifact in &unit.artifacts {
                if let ArtifactSource::Remote {
                    url,
                    remote: Some(remote),
                } = &artifact.source
                {
                    sqlx::query(
                        r#"
                        INSERT OR IGNORE INTO remote_artifacts
                            (content_unit_id, relative_path, url, remote_id, deferred)
                        VALUES (?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(unit_id)
                    .bind(&artifact.relative_path)
                    .bind(url)
                    .bind(&remote.id)
                    .bind(artifact.deferred)
                    .execute(&mut *tx_db)
                    .await?;
                }
            }
        }
        tx_db.commit().await?;
        for unit in batch {
            put(&tx, unit).await?;
        }
    }
    Ok(())
}

/// Build composite-to-member relations for units that declare members.
async fn interrelate_stage(
    ctx: PipelineContext,
    mut rx: mpsc::Receiver<DeclarativeUnit>,
    tx: mpsc::Sender<DeclarativeUnit>,
) -> Result<()> {
    while let Some(batch) = next_batch(&mut rx, ctx.batch_size).await {
        if ctx.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        let composites: Vec<(String, crate::models::MemberMatch)> = batch
            .iter()
            .filter_map(|unit| {
                match (&unit.content_unit_id, &unit.members) {
                    (Some(unit_id), Some(members)) => Some((unit_id.clone(), members.clone())),
                    _ => None,
                }
            })
            .collect();
        relate::relate_batch(&ctx.pool, &composites).await?;
        for unit in batch {
            put(&tx, unit).await?;
        }
    }
    Ok(())
}

/// Stamp the legacy mirror with the persisted target identity. This is
/// the step that makes a record count as migrated on the next run.
async fn relate_legacy_stage(
    ctx: PipelineContext,
    mut rx: mpsc::Receiver<DeclarativeUnit>,
    tx: mpsc::Sender<DeclarativeUnit>,
) -> Result<()> {
    while let Some(batch) = next_batch(&mut rx, ctx.batch_size).await {
        if ctx.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        let mut tx_db = ctx.pool.begin().await?;
        for unit in &batch {
            if let Some(unit_id) = &unit.content_unit_id {
                sqlx::query("UPDATE legacy_content SET content_unit_id = ? WHERE id = ?")
                    .bind(unit_id)
                    .bind(&unit.legacy.id)
                    .execute(&mut *tx_db)
                    .await?;
            }
        }
        tx_db.commit().await?;
        for unit in batch {
            put(&tx, unit).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn next_batch_drains_ready_items_without_waiting() {
        let (tx, mut rx) = mpsc::channel(8);
        for i in 0..5 {
            tx.send(i).await.unwrap();
        }
        let batch = next_batch(&mut rx, 3).await.unwrap();
        assert_eq!(batch, vec![0, 1, 2]);
        let batch = next_batch(&mut rx, 10).await.unwrap();
        assert_eq!(batch, vec![3, 4]);

        drop(tx);
        assert!(next_batch(&mut rx, 10).await.is_none());
    }
}
