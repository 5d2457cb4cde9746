//! Error types for the migration engine.
//!
//! The primary error type is `EngineError`, which represents pass-level errors
//! that stop an indexing or migration run. Row-level failures are recorded on
//! the IndexEntry (status ERRORED plus message) when continue-on-error is set,
//! and only surface as `EngineError::EntityFailed` otherwise.
//!
//! `RemoteError` is what the remote collaborators report for a single call.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::model::MigrationStatus;

/// Errors that stop an indexing or migration pass.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The store at `path` is bound to a different root or destination
    #[error(
        "index store {} is bound to {field} '{recorded}', not '{requested}'; use a new index file",
        .path.display()
    )]
    StoreConflict {
        path: PathBuf,
        field: &'static str,
        recorded: String,
        requested: String,
    },

    /// No index exists at `path`
    #[error("no index store found at {}; run indexing first", .path.display())]
    StoreNotFound { path: PathBuf },

    /// The file at `path` is not a readable index store
    #[error("index store {} is corrupt: {reason}", .path.display())]
    StoreCorrupt { path: PathBuf, reason: String },

    /// A write was attempted through a read-only handle
    #[error("index store {} was opened read-only", .path.display())]
    StoreReadOnly { path: PathBuf },

    /// Underlying SQLite failure
    #[error("index store error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure (store directory, CSV output)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV serialization failure
    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),

    /// Migration was not confirmed; nothing was changed
    #[error("migration of {pending} entries requires confirmation; nothing was changed")]
    ConfirmationRequired { pending: u64 },

    /// Options failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The walk root could not be resolved
    #[error("root entity {root_id} could not be resolved: {source}")]
    RootNotFound {
        root_id: String,
        #[source]
        source: RemoteError,
    },

    /// A row failed and continue-on-error was not set
    #[error("entity {entity_id}{} failed: {source}", fmt_version(.version))]
    EntityFailed {
        entity_id: String,
        version: Option<u32>,
        #[source]
        source: RemoteError,
    },

    /// A status change that the state machine does not allow
    #[error(
        "illegal status change for {entity_id}{}: {from} -> {to}",
        fmt_version(.version)
    )]
    InvalidTransition {
        entity_id: String,
        version: Option<u32>,
        from: MigrationStatus,
        to: MigrationStatus,
    },
}

fn fmt_version(version: &Option<u32>) -> String {
    match version {
        Some(v) => format!(" (version {})", v),
        None => String::new(),
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failure of a single remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The etag captured at index time no longer matches
    #[error("stale etag: {0}")]
    StaleEtag(String),

    /// Another writer holds the entity; worth retrying
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("throttled by remote service")]
    Throttled { retry_after: Option<Duration> },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// Returns true if backing off and repeating the call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Throttled { .. } | RemoteError::ConcurrentModification(_)
        )
    }

    /// Server-suggested delay before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}
