//! # Content Ferry
//!
//! A migration engine that moves content out of a legacy document-store
//! export and into a relational, content-addressed SQLite store.
//!
//! Content Ferry mirrors generic legacy records incrementally (watermark
//! extraction with conflict-ignore inserts), pre-migrates per-type detail
//! tables and the lazy download catalog, then migrates each content type
//! through a staged, bounded-queue pipeline: artifact dedup by digest,
//! content persistence by natural key, remote-origin linkage for deferred
//! payloads, and composite-to-member relation building. Runs are
//! incremental and safe to repeat.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Legacy export │──▶│  Extraction  │──▶│ legacy mirror  │
//! │ (JSONL docs)  │   │ (watermarks) │   │ + detail tables│
//! └──────────────┘   └──────────────┘   └───────┬───────┘
//!                                               │
//!                                               ▼
//!                    ┌─────────────────────────────────────┐
//!                    │ Staged pipeline (per content type)   │
//!                    │ generate ▶ artifacts ▶ content ▶     │
//!                    │ remotes ▶ relations ▶ stamp legacy   │
//!                    └──────────────────┬──────────────────┘
//!                                       ▼
//!                              ┌────────────────┐
//!                              │ Target (SQLite) │
//!                              └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ferry init                     # create the target database
//! ferry migrate --dry-run        # see what a run would do
//! ferry migrate                  # migrate every configured type
//! ferry status                   # per-type progress
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`legacy`] | Legacy store read interface and JSONL export reader |
//! | [`extract`] | Watermark extraction and detail pre-migration |
//! | [`plugin`] | Content type plugin contract and registry |
//! | [`pipeline`] | Staged, concurrent per-type migration pipeline |
//! | [`relate`] | Composite-to-member relation building |
//! | [`remotes`] | Remote pre-migration and memoized resolution |
//! | [`future`] | Promises for not-yet-persisted content identities |
//! | [`progress`] | Progress reporting on stderr |
//! | [`run`] | Whole-run orchestration |
//! | [`db`] | Database connection |
//! | [`schema`] | Target schema creation |

pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod future;
pub mod legacy;
pub mod models;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod progress;
pub mod relate;
pub mod remotes;
pub mod run;
pub mod schema;
