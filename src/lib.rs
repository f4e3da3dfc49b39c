//! Update ingestion for project history: queued editor edits become ordered,
//! versioned changes in an append-only chunk store.
//!
//! One worker at a time drains a project's queue under a distributed lock,
//! compresses the edits, uploads any blobs they reference, translates them
//! into changes and commits them at the expected base version. When stored
//! history drifts from the authoritative project structure, a resync
//! reconciles the two.
//!
//! # Examples
//!
//! Processing one project against in-memory state:
//! ```no_run
//! use std::sync::Arc;
//!
//! use project_history::{
//!     clients::http::{HttpChunkStore, HttpFileStore, HttpMetadataClient},
//!     config::Config,
//!     pipeline::{Collaborators, IngestionPipeline},
//!     store::memory::MemoryStore,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> project_history::error::HistoryResult<()> {
//! let config = Config::default();
//! let collaborators = Collaborators::from_store(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(HttpChunkStore::new(&config.endpoints)?),
//!     Arc::new(HttpMetadataClient::new(&config.endpoints)?),
//!     Arc::new(HttpFileStore::new(&config.endpoints)?),
//! );
//! let pipeline = IngestionPipeline::new(&config, collaborators);
//! pipeline.process_updates_for_project("project-1").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Worker processes on one host can share state through SQLite:
//! ```no_run
//! use project_history::store::sqlite::SqliteStore;
//!
//! let store = SqliteStore::open("project-history.db").expect("open sqlite");
//! # let _ = store;
//! ```
#![deny(missing_docs)]

/// Content-addressed blob creation.
pub mod blob;
/// Canonical change model.
pub mod change;
/// Chunk wire model, baseline derivation and snapshot replay.
pub mod chunk;
/// Chunk store, metadata service and file store clients.
pub mod clients;
/// Merging of adjacent text edits.
pub mod compress;
/// Per-component configuration.
pub mod config;
/// Time-bounded character diff.
pub mod diff;
/// Error taxonomy and context tagging.
pub mod error;
/// Sweep over projects with old queued edits.
pub mod flush;
/// Git-style blob hashing.
pub mod hash;
/// Per-project failure records.
pub mod ledger;
/// Distributed per-project lock.
pub mod lock;
/// Queue processing for one project.
pub mod pipeline;
/// Bounded queue reads.
pub mod queue;
/// Reconciliation against the authoritative project structure.
pub mod resync;
/// Sweep over failed projects.
pub mod retry;
/// Lock, queue and state backends.
pub mod store;
/// Resync state machine and its persisted record.
pub mod sync_state;
/// Retain/insert/delete text operations.
pub mod text_operation;
/// Raw edits to changes, and path normalization.
pub mod translate;
/// Shared identifiers.
pub mod types;
/// Raw edit wire model.
pub mod update;
/// Project and doc versions.
pub mod version;
