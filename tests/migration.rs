//! End-to-end migration tests against a real SQLite target and an
//! in-memory legacy export.

use std::sync::Arc;

use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use content_ferry::db;
use content_ferry::error::Result as FerryResult;
use content_ferry::legacy::{JsonExportStore, LegacyStore};
use content_ferry::models::{
    CandidateContent, DetailRecord, LazyCatalogEntry, LegacyContentRecord, LegacyImporter,
};
use content_ferry::plugin::{ContentTypePlugin, PluginCapabilities, PluginRegistry};
use content_ferry::progress::{NoProgress, ProgressEvent, ProgressReporter};
use content_ferry::run::{run_migration, RunOptions, RunReport};

async fn target_pool(tmp: &TempDir) -> SqlitePool {
    db::connect(&tmp.path().join("ferry.sqlite")).await.unwrap()
}

fn options(batch_size: usize) -> RunOptions {
    RunOptions {
        dry_run: false,
        batch_size,
        queue_depth: 8,
        content_types: Vec::new(),
    }
}

async fn migrate(pool: &SqlitePool, legacy: JsonExportStore, batch_size: usize) -> RunReport {
    run_migration(
        pool,
        Arc::new(legacy),
        Arc::new(PluginRegistry::built_in()),
        &options(batch_size),
        Arc::new(NoProgress),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

fn package_doc(n: usize, last_updated: i64) -> serde_json::Value {
    json!({
        "id": format!("pkg-{n}"),
        "content_type_id": "package",
        "last_updated": last_updated,
        "downloaded": true,
        "storage_path": format!("/var/lib/legacy/pkg-{n}.rpm"),
        "name": format!("tool{n}"),
        "epoch": "0",
        "version": "1.0",
        "release": "1",
        "arch": "x86_64",
        "checksum": format!("{n:064x}"),
        "checksum_type": "sha256",
        "size": 1024 + n,
        "filename": format!("tool{n}-1.0-1.x86_64.rpm"),
    })
}

fn type_report<'a>(report: &'a RunReport, content_type: &str) -> &'a content_ferry::run::TypeReport {
    report
        .types
        .iter()
        .find(|t| t.content_type == content_type)
        .unwrap()
}

async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

#[tokio::test]
async fn end_to_end_migration_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    let docs: Vec<_> = (1..=150).map(|n| package_doc(n, n as i64)).collect();
    let store = || JsonExportStore::from_records(docs.clone(), vec![], vec![]);

    let report = migrate(&pool, store(), 100).await;
    let pkg = type_report(&report, "package");
    assert_eq!(pkg.extracted_total, 150);
    assert_eq!(pkg.extracted, 150);
    assert_eq!(pkg.migrated, 150);
    assert_eq!(pkg.skipped, 0);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_units").await, 150);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM artifacts").await, 150);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM legacy_content WHERE content_unit_id IS NULL"
        )
        .await,
        0
    );

    // A second run over the same export finds nothing new to do.
    let report = migrate(&pool, store(), 100).await;
    let pkg = type_report(&report, "package");
    assert_eq!(pkg.extracted, 0);
    assert_eq!(pkg.migrated, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_units").await, 150);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM artifacts").await, 150);
}

#[tokio::test]
async fn boundary_records_are_excluded_not_remigrated() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    let first = vec![package_doc(1, 5), package_doc(2, 5), package_doc(3, 9)];
    migrate(
        &pool,
        JsonExportStore::from_records(first.clone(), vec![], vec![]),
        50,
    )
    .await;

    // The export grew: one new record sharing the watermark timestamp and
    // one strictly newer.
    let mut second = first;
    second.push(package_doc(4, 9));
    second.push(package_doc(5, 12));
    let report = migrate(&pool, JsonExportStore::from_records(second, vec![], vec![]), 50).await;

    let pkg = type_report(&report, "package");
    assert_eq!(pkg.excluded, 1);
    assert_eq!(pkg.extracted, 2);
    assert_eq!(pkg.migrated, 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_units").await, 5);
}

#[tokio::test]
async fn artifacts_dedup_by_digest() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    // Two distinct packages carrying byte-identical payloads.
    let mut a = package_doc(1, 1);
    let mut b = package_doc(2, 2);
    a["checksum"] = json!("f".repeat(64));
    b["checksum"] = json!("f".repeat(64));

    let report = migrate(&pool, JsonExportStore::from_records(vec![a, b], vec![], vec![]), 50).await;
    assert_eq!(type_report(&report, "package").migrated, 2);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM artifacts").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_units").await, 2);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(DISTINCT artifact_id) FROM content_artifacts"
        )
        .await,
        1
    );
}

#[tokio::test]
async fn undownloaded_content_without_catalog_entry_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    let mut doc = package_doc(1, 1);
    doc["downloaded"] = json!(false);
    doc["storage_path"] = json!(null);

    let report = migrate(&pool, JsonExportStore::from_records(vec![doc], vec![], vec![]), 50).await;
    let pkg = type_report(&report, "package");
    assert_eq!(pkg.extracted, 1);
    assert_eq!(pkg.migrated, 0);
    assert_eq!(pkg.skipped, 1);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_units").await, 0);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM legacy_content WHERE content_unit_id IS NULL"
        )
        .await,
        1
    );
}

#[tokio::test]
async fn deferred_content_links_remote_artifacts_without_payload() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    let mut doc = package_doc(1, 1);
    doc["downloaded"] = json!(false);
    doc["storage_path"] = json!(null);

    let catalog = vec![
        LazyCatalogEntry {
            importer_id: "imp-a".to_string(),
            unit_id: "pkg-1".to_string(),
            content_type_id: "package".to_string(),
            storage_path: None,
            url: "https://mirror-a.example/tool1.rpm".to_string(),
            revision: 1,
        },
        LazyCatalogEntry {
            importer_id: "imp-b".to_string(),
            unit_id: "pkg-1".to_string(),
            content_type_id: "package".to_string(),
            storage_path: None,
            url: "https://mirror-b.example/tool1.rpm".to_string(),
            revision: 1,
        },
    ];
    let importers = vec![
        LegacyImporter {
            importer_id: "imp-a".to_string(),
            name: "mirror-a".to_string(),
            feed_url: Some("https://mirror-a.example/".to_string()),
        },
        LegacyImporter {
            importer_id: "imp-b".to_string(),
            name: "mirror-b".to_string(),
            feed_url: Some("https://mirror-b.example/".to_string()),
        },
    ];

    let report = migrate(
        &pool,
        JsonExportStore::from_records(vec![doc], catalog, importers),
        50,
    )
    .await;
    assert_eq!(report.remotes_created, 2);
    let pkg = type_report(&report, "package");
    assert_eq!(pkg.migrated, 1);
    assert_eq!(pkg.skipped, 0);

    // One content unit, two remote origins, no payload bytes.
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_units").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM artifacts").await, 0);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM remote_artifacts WHERE deferred = 1").await,
        2
    );
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM content_artifacts WHERE artifact_id IS NULL"
        )
        .await,
        1
    );
}

#[tokio::test]
async fn deferred_content_with_unresolvable_remote_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    let mut doc = package_doc(1, 1);
    doc["downloaded"] = json!(false);
    doc["storage_path"] = json!(null);

    let catalog = vec![LazyCatalogEntry {
        importer_id: "imp-feedless".to_string(),
        unit_id: "pkg-1".to_string(),
        content_type_id: "package".to_string(),
        storage_path: None,
        url: "https://gone.example/tool1.rpm".to_string(),
        revision: 1,
    }];
    // The importer exists but never had a feed URL, so no remote is created.
    let importers = vec![LegacyImporter {
        importer_id: "imp-feedless".to_string(),
        name: "feedless".to_string(),
        feed_url: None,
    }];

    let report = migrate(
        &pool,
        JsonExportStore::from_records(vec![doc], catalog, importers),
        50,
    )
    .await;
    assert_eq!(report.remotes_created, 0);
    let pkg = type_report(&report, "package");
    assert_eq!(pkg.migrated, 0);
    assert_eq!(pkg.skipped, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_units").await, 0);
}

#[tokio::test]
async fn module_members_relate_to_first_matching_package() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    // Two modular packages sharing one attribute tuple (different
    // payloads), plus one non-modular package with the same name.
    let mut pkg1 = package_doc(1, 1);
    let mut pkg2 = package_doc(2, 2);
    let mut plain = package_doc(3, 3);
    for (pkg, modular) in [(&mut pkg1, true), (&mut pkg2, true), (&mut plain, false)] {
        pkg["name"] = json!("httpd");
        pkg["version"] = json!("2.4");
        pkg["is_modular"] = json!(modular);
    }

    let module = json!({
        "id": "mod-1",
        "content_type_id": "module",
        "last_updated": 4,
        "name": "httpd",
        "stream": "2.4",
        "members": [
            {"name": "httpd", "epoch": "0", "version": "2.4", "release": "1", "arch": "x86_64"},
            {"name": "missing", "epoch": "0", "version": "9", "release": "9", "arch": "noarch"}
        ]
    });

    let report = migrate(
        &pool,
        JsonExportStore::from_records(vec![pkg1, pkg2, plain, module], vec![], vec![]),
        50,
    )
    .await;
    assert_eq!(type_report(&report, "package").migrated, 3);
    assert_eq!(type_report(&report, "module").migrated, 1);

    // One relation row: the first persisted modular package claims the
    // tuple, the second duplicate and the non-modular one do not; the
    // unmatched member ref relates nothing.
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_relations").await, 1);

    let child_key: String = sqlx::query_scalar(
        "SELECT cu.natural_key FROM content_relations cr \
         JOIN content_units cu ON cu.id = cr.child_id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(child_key.contains(&format!("{:064x}", 1)));

    let parent_key: String = sqlx::query_scalar(
        "SELECT cu.natural_key FROM content_relations cr \
         JOIN content_units cu ON cu.id = cr.parent_id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(parent_key, "httpd:2.4");
}

#[tokio::test]
async fn dry_run_writes_no_content() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    let docs: Vec<_> = (1..=10).map(|n| package_doc(n, n as i64)).collect();
    let report = run_migration(
        &pool,
        Arc::new(JsonExportStore::from_records(docs, vec![], vec![])),
        Arc::new(PluginRegistry::built_in()),
        &RunOptions {
            dry_run: true,
            ..options(50)
        },
        Arc::new(NoProgress),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(report.dry_run);
    assert_eq!(type_report(&report, "package").extracted_total, 10);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM legacy_content").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_units").await, 0);
}

#[tokio::test]
async fn relation_transaction_failure_rolls_back_and_rerun_completes() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    // Occupy the associations table with an incompatible shape before the
    // schema runs; the relation insert then fails at prepare time while
    // every other table is healthy.
    sqlx::query("CREATE TABLE content_relations (parent_id TEXT NOT NULL)")
        .execute(&pool)
        .await
        .unwrap();

    let mut pkg = package_doc(1, 1);
    pkg["name"] = json!("httpd");
    pkg["version"] = json!("2.4");
    pkg["is_modular"] = json!(true);
    let module = json!({
        "id": "mod-1",
        "content_type_id": "module",
        "last_updated": 2,
        "name": "httpd",
        "stream": "2.4",
        "members": [
            {"name": "httpd", "epoch": "0", "version": "2.4", "release": "1", "arch": "x86_64"}
        ]
    });
    let store = || {
        JsonExportStore::from_records(vec![pkg.clone(), module.clone()], vec![], vec![])
    };

    let report = migrate(&pool, store(), 50).await;
    assert!(type_report(&report, "package").error.is_none());
    assert_eq!(type_report(&report, "package").migrated, 1);
    let module_report = type_report(&report, "module");
    assert!(module_report
        .error
        .as_deref()
        .unwrap()
        .contains("relation batch transaction failed"));

    // The failed transaction left no partial association rows and the
    // module's legacy mirror is still unstamped.
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_relations").await, 0);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM legacy_content \
             WHERE content_type_id = 'module' AND content_unit_id IS NOT NULL"
        )
        .await,
        0
    );

    // Restore the table and rerun: the pending module is re-processed and
    // its relations land.
    sqlx::query("DROP TABLE content_relations")
        .execute(&pool)
        .await
        .unwrap();
    let report = migrate(&pool, store(), 50).await;
    assert!(report.succeeded());
    assert_eq!(type_report(&report, "module").migrated, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_relations").await, 1);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM legacy_content WHERE content_unit_id IS NULL"
        )
        .await,
        0
    );
}

/// Cancels the run the first time the named task reports forward progress.
struct CancelDuring {
    task: &'static str,
    cancel: CancellationToken,
}

impl ProgressReporter for CancelDuring {
    fn report(&self, event: ProgressEvent) {
        if let ProgressEvent::Advanced { task, .. } = event {
            if task == self.task {
                self.cancel.cancel();
            }
        }
    }
}

#[tokio::test]
async fn cancellation_mid_pipeline_is_recorded_and_rerun_converges() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    let docs: Vec<_> = (1..=200).map(|n| package_doc(n, n as i64)).collect();
    let store = || JsonExportStore::from_records(docs.clone(), vec![], vec![]);

    // Small queues and batches keep the in-flight window well under the
    // record count, so cancellation lands while units are still pending.
    let cancel = CancellationToken::new();
    let reporter = Arc::new(CancelDuring {
        task: "migrate package",
        cancel: cancel.clone(),
    });
    let report = run_migration(
        &pool,
        Arc::new(store()),
        Arc::new(PluginRegistry::built_in()),
        &RunOptions {
            dry_run: false,
            batch_size: 5,
            queue_depth: 2,
            content_types: vec!["package".to_string()],
        },
        reporter,
        cancel,
    )
    .await
    .unwrap();

    assert!(!report.succeeded());
    assert!(type_report(&report, "package")
        .error
        .as_deref()
        .unwrap()
        .contains("cancelled"));

    let stamped = count(
        &pool,
        "SELECT COUNT(*) FROM legacy_content WHERE content_unit_id IS NOT NULL",
    )
    .await;
    assert!(stamped >= 1, "at least one record completed before the cancel");
    assert!(stamped < 200, "cancellation stopped the run early");

    // A fresh run picks up every unstamped record, including any content
    // row persisted before the cancel but never linked back, and converges
    // without duplicating rows.
    let report = migrate(&pool, store(), 50).await;
    assert!(report.succeeded());
    assert_eq!(type_report(&report, "package").migrated as i64, 200 - stamped);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM content_units").await, 200);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM artifacts").await, 200);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM legacy_content WHERE content_unit_id IS NULL"
        )
        .await,
        0
    );
}

/// Declares a payload capability but can never name an artifact path.
struct PathlessPlugin;

#[async_trait]
impl ContentTypePlugin for PathlessPlugin {
    fn content_type_id(&self) -> &'static str {
        "blob"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            payload: true,
            relations: false,
        }
    }

    async fn ensure_schema(&self, _pool: &SqlitePool) -> FerryResult<()> {
        Ok(())
    }

    async fn pre_migrate_detail(
        &self,
        _pool: &SqlitePool,
        _legacy: &dyn LegacyStore,
        _batch: &[LegacyContentRecord],
    ) -> FerryResult<u64> {
        Ok(0)
    }

    async fn load_pending_details(&self, _pool: &SqlitePool) -> FerryResult<Vec<DetailRecord>> {
        Ok(vec![DetailRecord {
            legacy: LegacyContentRecord {
                id: "row-1".to_string(),
                legacy_id: "blob-1".to_string(),
                content_type_id: "blob".to_string(),
                last_updated: 1,
                storage_path: None,
                downloaded: true,
                content_unit_id: None,
            },
            natural_key: "blob-1".to_string(),
            data: json!({}),
        }])
    }

    fn create_target_content(&self, detail: &DetailRecord) -> CandidateContent {
        CandidateContent {
            content_type_id: "blob".to_string(),
            natural_key: detail.natural_key.clone(),
            data: detail.data.clone(),
        }
    }
}

#[tokio::test]
async fn payload_plugin_without_artifact_path_fails_before_its_pipeline() {
    let tmp = TempDir::new().unwrap();
    let pool = target_pool(&tmp).await;

    let mut registry = PluginRegistry::built_in();
    registry.register(Arc::new(PathlessPlugin)).unwrap();

    let report = run_migration(
        &pool,
        Arc::new(JsonExportStore::from_records(
            vec![package_doc(1, 1)],
            vec![],
            vec![],
        )),
        Arc::new(registry),
        &options(50),
        Arc::new(NoProgress),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // The contract violation is fatal for the one type, before any of its
    // units move, and leaves siblings untouched.
    let blob = type_report(&report, "blob");
    assert!(blob
        .error
        .as_deref()
        .unwrap()
        .contains("missing a required capability"));
    assert_eq!(blob.migrated, 0);
    assert_eq!(type_report(&report, "package").migrated, 1);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM content_units WHERE content_type_id = 'blob'"
        )
        .await,
        0
    );
}
