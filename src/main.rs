//! # Content Ferry CLI (`ferry`)
//!
//! The `ferry` binary drives migrations from a legacy document-store
//! content export into the relational target store.
//!
//! ## Usage
//!
//! ```bash
//! ferry --config ./config/ferry.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ferry init` | Create the SQLite target database and schema |
//! | `ferry types` | List registered content type plugins |
//! | `ferry migrate` | Run a migration (extraction + pipelines) |
//! | `ferry status` | Show per-type migration progress in the target |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the target database
//! ferry init --config ./config/ferry.toml
//!
//! # See what a run would do, without writing
//! ferry migrate --dry-run
//!
//! # Migrate only packages, with JSON progress on stderr
//! ferry migrate --type package --progress json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use content_ferry::config::Config;
use content_ferry::legacy::JsonExportStore;
use content_ferry::plugin::PluginRegistry;
use content_ferry::progress::ProgressMode;
use content_ferry::run::{run_migration, RunOptions};
use content_ferry::{db, schema};

/// Content Ferry — migrate content from a legacy document-store export
/// into a relational, content-addressed store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ferry.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ferry",
    about = "Content Ferry — legacy content store migration tool",
    version,
    long_about = "Content Ferry mirrors generic content records out of a legacy \
    document-store export, pre-migrates per-type details, and migrates each content \
    type through a staged, concurrent pipeline into a relational SQLite store with \
    content-addressed artifact dedup. Runs are incremental and safe to repeat."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ferry.toml`. The legacy export location,
    /// target database path, and migration tuning are read from this file.
    #[arg(long, global = true, default_value = "./config/ferry.toml")]
    config: PathBuf,

    /// Progress reporting on stderr. Defaults to `human` when stderr is
    /// a TTY, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the target database schema.
    ///
    /// Creates the SQLite database file, the engine tables, and every
    /// registered plugin's detail tables. Idempotent.
    Init,

    /// List registered content type plugins and their capabilities.
    Types,

    /// Run a migration.
    ///
    /// Extracts fresh legacy records above each type's watermark,
    /// pre-migrates details and the lazy catalog, then migrates every
    /// selected type through the staged pipeline. Prints a JSON run
    /// report on stdout.
    Migrate {
        /// Migrate only this content type. Repeatable; default is every
        /// type named in the config, or every registered type.
        #[arg(long = "type")]
        content_types: Vec<String>,

        /// Report what would be done without writing content.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show per-type migration progress recorded in the target store.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(PluginRegistry::built_in());

    // No config needed to list plugins.
    if let Commands::Types = cli.command {
        for plugin in registry.plugins() {
            let caps = plugin.capabilities();
            let kind = match (caps.payload, caps.relations) {
                (true, true) => "payload, relations",
                (true, false) => "payload",
                (false, true) => "relations",
                (false, false) => "metadata only",
            };
            println!("{:<16} {kind}", plugin.content_type_id());
        }
        return Ok(());
    }

    let cfg = Config::load(&cli.config)?;
    let pool = db::connect(&cfg.target.db_path).await?;

    match cli.command {
        Commands::Types => unreachable!("handled above"),
        Commands::Init => {
            schema::create_schema(&pool, &registry).await?;
            println!("Target database initialized at {}.", cfg.target.db_path.display());
        }
        Commands::Migrate {
            content_types,
            dry_run,
        } => {
            let legacy = Arc::new(JsonExportStore::open(&cfg.legacy.export_dir)?);
            let reporter: Arc<dyn content_ferry::progress::ProgressReporter> = cli
                .progress
                .map(ProgressArg::mode)
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter()
                .into();

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupted, finishing current batches...");
                    ctrl_c_cancel.cancel();
                }
            });

            let options = RunOptions {
                dry_run,
                batch_size: cfg.migration.batch_size,
                queue_depth: cfg.migration.queue_depth,
                content_types: if content_types.is_empty() {
                    cfg.migration.content_types.clone()
                } else {
                    content_types
                },
            };
            let report =
                run_migration(&pool, legacy, registry, &options, reporter, cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.succeeded() {
                anyhow::bail!("one or more content types failed to migrate");
            }
        }
        Commands::Status => {
            let rows = sqlx::query(
                r#"
                SELECT content_type_id,
                       COUNT(*) AS total,
                       SUM(CASE WHEN content_unit_id IS NOT NULL THEN 1 ELSE 0 END) AS migrated
                FROM legacy_content
                GROUP BY content_type_id
                ORDER BY content_type_id
                "#,
            )
            .fetch_all(&pool)
            .await?;
            if rows.is_empty() {
                println!("No legacy content extracted yet.");
            } else {
                println!("{:<16} {:>10} {:>10} {:>10}", "TYPE", "TOTAL", "MIGRATED", "PENDING");
                for row in rows {
                    let total: i64 = row.get("total");
                    let migrated: i64 = row.get("migrated");
                    println!(
                        "{:<16} {:>10} {:>10} {:>10}",
                        row.get::<String, _>("content_type_id"),
                        total,
                        migrated,
                        total - migrated
                    );
                }
            }
            let artifacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts")
                .fetch_one(&pool)
                .await?;
            let units: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_units")
                .fetch_one(&pool)
                .await?;
            println!("\n{units} content units, {artifacts} artifacts.");
        }
    }
    Ok(())
}
