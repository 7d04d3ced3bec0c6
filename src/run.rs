//! Whole-run orchestration: plan validation, remote pre-migration, the
//! extraction barrier, and the pipeline waves.
//!
//! Extraction for every selected type completes before any pipeline
//! starts, so composite types can rely on their member types' generic
//! records being present. Pipelines then run in two waves: types without
//! member relations first, relation-bearing types second, concurrently
//! within each wave. That ordering is what lets a module's member match
//! find packages already persisted.
//!
//! A failure in one type's extraction or pipeline is recorded in that
//! type's report entry and does not abort sibling types.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{MigrationError, Result};
use crate::extract::{self, ExtractionOutcome};
use crate::future::FutureBook;
use crate::legacy::LegacyStore;
use crate::pipeline::{self, PipelineContext};
use crate::plugin::{ContentTypePlugin, PluginRegistry};
use crate::progress::ProgressReporter;
use crate::remotes::{self, RemoteResolver};
use crate::schema;

/// Knobs for one migration run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Report the plan without migrating anything.
    pub dry_run: bool,
    pub batch_size: usize,
    pub queue_depth: usize,
    /// Content type ids to migrate; empty means every registered type.
    pub content_types: Vec<String>,
}

/// Per-type counters for the run report.
#[derive(Debug, Clone, Serialize)]
pub struct TypeReport {
    pub content_type: String,
    /// Items extraction was responsible for, after boundary corrections.
    pub extracted_total: u64,
    pub extracted: u64,
    /// Boundary duplicates excluded from re-extraction.
    pub excluded: u64,
    pub migrated: u64,
    pub skipped: u64,
    /// Set when this type's extraction or pipeline failed; siblings are
    /// unaffected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TypeReport {
    fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            extracted_total: 0,
            extracted: 0,
            excluded: 0,
            migrated: 0,
            skipped: 0,
            error: None,
        }
    }
}

/// Summary of a whole migration run, printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub remotes_created: u64,
    pub types: Vec<TypeReport>,
}

impl RunReport {
    /// True when every selected type completed without error.
    pub fn succeeded(&self) -> bool {
        self.types.iter().all(|t| t.error.is_none())
    }
}

pub async fn run_migration(
    pool: &SqlitePool,
    legacy: Arc<dyn LegacyStore>,
    registry: Arc<PluginRegistry>,
    options: &RunOptions,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let started_at = Utc::now();
    let plan = resolve_plan(&registry, &options.content_types)?;
    schema::create_schema(pool, &registry).await?;

    if options.dry_run {
        let types = dry_run_report(pool, legacy.as_ref(), &plan).await?;
        return Ok(RunReport {
            started_at,
            finished_at: Utc::now(),
            dry_run: true,
            remotes_created: 0,
            types,
        });
    }

    let remotes_created = remotes::pre_migrate_remotes(pool, legacy.as_ref()).await?;
    info!(remotes_created, "remotes pre-migrated");

    let mut reports: HashMap<String, TypeReport> = plan
        .iter()
        .map(|p| {
            let id = p.content_type_id();
            (id.to_string(), TypeReport::new(id))
        })
        .collect();

    // Extraction barrier: every type's generic records and catalog land
    // before any pipeline begins.
    let mut extractions: JoinSet<(String, Result<ExtractionOutcome>)> = JoinSet::new();
    for plugin in &plan {
        let pool = pool.clone();
        let legacy = legacy.clone();
        let plugin = plugin.clone();
        let reporter = reporter.clone();
        let cancel = cancel.clone();
        let batch_size = options.batch_size;
        extractions.spawn(async move {
            let outcome = extract::pre_migrate_type(
                &pool,
                legacy.as_ref(),
                plugin.as_ref(),
                batch_size,
                reporter.as_ref(),
                &cancel,
            )
            .await;
            (plugin.content_type_id().to_string(), outcome)
        });
    }
    while let Some(joined) = extractions.join_next().await {
        let (content_type, outcome) = joined.map_err(|e| MigrationError::Stage(e.to_string()))?;
        let report = reports
            .get_mut(&content_type)
            .ok_or_else(|| MigrationError::Stage(format!("unplanned type {content_type}")))?;
        match outcome {
            Ok(ex) => {
                report.extracted_total = ex.total;
                report.extracted = ex.done;
                report.excluded = ex.excluded;
            }
            Err(err) => {
                error!(content_type = %report.content_type, %err, "extraction failed");
                report.error = Some(err.to_string());
            }
        }
    }

    let ctx = PipelineContext {
        pool: pool.clone(),
        resolver: Arc::new(RemoteResolver::new(pool.clone())),
        futures: Arc::new(FutureBook::new()),
        cancel,
        queue_depth: options.queue_depth,
        batch_size: options.batch_size,
    };

    // Two waves: relation-free types first, then composite types whose
    // member matching needs the first wave persisted.
    let plain: Vec<_> = plan
        .iter()
        .filter(|p| !p.capabilities().relations)
        .cloned()
        .collect();
    let composite: Vec<_> = plan
        .iter()
        .filter(|p| p.capabilities().relations)
        .cloned()
        .collect();
    for wave in [plain, composite] {
        let mut pipelines: JoinSet<(String, Result<pipeline::PipelineOutcome>)> = JoinSet::new();
        for plugin in wave {
            let content_type = plugin.content_type_id().to_string();
            // A type whose extraction failed does not get a pipeline.
            if reports
                .get(&content_type)
                .is_some_and(|r| r.error.is_some())
            {
                continue;
            }
            let ctx = ctx.clone();
            let reporter = reporter.clone();
            pipelines.spawn(async move {
                let outcome =
                    pipeline::run_type_pipeline(&ctx, plugin.clone(), reporter.as_ref()).await;
                (content_type, outcome)
            });
        }
        while let Some(joined) = pipelines.join_next().await {
            let (content_type, outcome) =
                joined.map_err(|e| MigrationError::Stage(e.to_string()))?;
            let report = reports
                .get_mut(&content_type)
                .ok_or_else(|| MigrationError::Stage(format!("unplanned type {content_type}")))?;
            match outcome {
                Ok(out) => {
                    report.migrated = out.migrated;
                    report.skipped = out.skipped;
                }
                Err(err) => {
                    error!(content_type = %report.content_type, %err, "pipeline failed");
                    report.error = Some(err.to_string());
                }
            }
        }
    }

    let mut types: Vec<TypeReport> = reports.into_values().collect();
    types.sort_by(|a, b| a.content_type.cmp(&b.content_type));

    let report = RunReport {
        started_at,
        finished_at: Utc::now(),
        dry_run: false,
        remotes_created,
        types,
    };
    info!(
        types = report.types.len(),
        succeeded = report.succeeded(),
        "migration run finished"
    );
    Ok(report)
}

/// Content types selected for this run, validated against the registry.
fn resolve_plan(
    registry: &PluginRegistry,
    requested: &[String],
) -> Result<Vec<Arc<dyn ContentTypePlugin>>> {
    if requested.is_empty() {
        return Ok(registry.plugins().to_vec());
    }
    let mut plan = Vec::with_capacity(requested.len());
    for type_id in requested {
        let plugin = registry
            .get(type_id)
            .ok_or_else(|| MigrationError::MissingCapability {
                content_type: type_id.clone(),
                capability: "registered plugin".to_string(),
            })?;
        plan.push(plugin);
    }
    Ok(plan)
}

/// What a real run would process, computed read-only against the legacy
/// store and the watermarks already in the target.
async fn dry_run_report(
    pool: &SqlitePool,
    legacy: &dyn LegacyStore,
    plan: &[Arc<dyn ContentTypePlugin>],
) -> Result<Vec<TypeReport>> {
    let mut types = Vec::with_capacity(plan.len());
    for plugin in plan {
        let content_type = plugin.content_type_id();
        let watermark: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(last_updated), 0) FROM legacy_content WHERE content_type_id = ?",
        )
        .bind(content_type)
        .fetch_one(pool)
        .await?;
        let fresh = legacy.content_since(content_type, watermark).await?.len() as u64;
        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM legacy_content \
             WHERE content_type_id = ? AND content_unit_id IS NULL",
        )
        .bind(content_type)
        .fetch_one(pool)
        .await?;
        let mut report = TypeReport::new(content_type);
        report.extracted_total = fresh;
        report.migrated = pending as u64;
        types.push(report);
    }
    Ok(types)
}
