//! # Relocate Engine - Storage Location Migration Library
//!
//! A headless engine that moves remotely stored entities to a new storage
//! location without re-uploading their bytes. Designed as the foundation for
//! the CLI and any other front-end.
//!
//! ## Overview
//!
//! A migration runs in two passes over a durable local index:
//! - Indexing walks a project or folder and records one row per entity version
//!   with its current storage location
//! - Migration re-points every INDEXED row at the destination and records the
//!   outcome row by row, so an interrupted run can simply be restarted
//!
//! Remote access is injected through the [`EntityLister`] and
//! [`StorageMutator`] traits; progress is reported through
//! [`ProgressCallback`] and runs can be stopped with a [`CancelFlag`].
//!
//! ## Basic Usage
//!
//! ```no_run
//! use relocate_engine::{
//!     index_files, migrate_indexed, EntityLister, IndexOptions, IndexStore, MigrateOptions,
//!     MigrationResult, RunContext, StorageMutator,
//! };
//!
//! # fn run<R: EntityLister + StorageMutator>(remote: &R) -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = RunContext::default();
//!
//! // Index the project
//! let options = IndexOptions::new("syn123", "9001");
//! let summary = index_files(remote, "index.db", &options, &ctx)?;
//! println!("Indexed: {}", summary.counts);
//!
//! // Migrate, skipping the interactive confirmation
//! let store = IndexStore::open_existing("index.db")?;
//! let migrate = MigrateOptions { force: true, ..MigrateOptions::default() };
//! migrate_indexed(remote, &store, &migrate, None, &ctx)?;
//!
//! // Report
//! let result = MigrationResult::new(&store, Some("result.csv".into()));
//! result.write_csv()?;
//! println!("Final: {}", result.counts()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (IndexEntry, statuses, strategies)
//! - **error**: Error types and handling
//! - **config**: Option records with defaults and validation
//! - **store**: SQLite-backed index store
//! - **remote**: Remote collaborator traits and retry helper
//! - **walker**: Hierarchy traversal
//! - **index**: Indexing coordinator
//! - **migrate**: Migration executor
//! - **report**: Result view and CSV export
//! - **progress**: Progress callback trait and cancellation

pub mod config;
pub mod error;
pub mod index;
pub mod migrate;
pub mod model;
mod parallel;
pub mod progress;
pub mod remote;
pub mod report;
pub mod store;
pub mod walker;

// Re-export main types and functions
pub use config::{IndexOptions, MigrateOptions, RetryPolicy};
pub use error::{EngineError, EngineResult, RemoteError};
pub use index::{index_files, index_into, reindex_errored, IndexingSummary};
pub use migrate::{migrate_indexed, Confirm, MigrationPreview, MigrationSummary, SnapshotFailure};
pub use model::{
    EntityType, EntryKey, IndexEntry, MigrationStatus, StatusCounts, StatusUpdate, VersionStrategy,
};
pub use progress::{CancelFlag, ProgressCallback, RunContext};
pub use remote::{
    ChildPage, EntityHeader, EntityLister, MoveOutcome, MoveRequest, RemoteKind, SnapshotOutcome,
    StorageMutator, VersionInfo, VersionPage,
};
pub use report::MigrationResult;
pub use store::{EntryIter, IndexStore, StoreBinding};
