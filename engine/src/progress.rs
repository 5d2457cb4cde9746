//! Progress reporting and cancellation hooks.
//!
//! This module defines the ProgressCallback trait, which decouples the
//! engine from any specific UI technology, and the CancelFlag used to stop
//! a run cooperatively between entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::index::IndexingSummary;
use crate::migrate::MigrationSummary;
use crate::model::IndexEntry;

/// Trait for receiving progress updates from indexing and migration.
///
/// All methods are called synchronously from the run's control loop, after
/// the corresponding store write has been committed. Every method has a
/// no-op default so implementors only override what they display.
pub trait ProgressCallback: Send + Sync {
    /// Called once the store is open and the walk is about to start.
    fn on_index_started(&self, _root_id: &str, _destination_location_id: &str) {}

    /// Called after an entry has been written to the store.
    fn on_entry_indexed(&self, _entry: &IndexEntry) {}

    /// Called when the indexing pass finishes (including cancelled passes).
    fn on_index_completed(&self, _summary: &IndexingSummary) {}

    /// Called before the first move, with the number of INDEXED entries.
    fn on_migration_started(&self, _pending: u64) {}

    /// Called after an entry's new status has been committed.
    fn on_entry_migrated(&self, _entry: &IndexEntry) {}

    /// Called when the migration pass finishes (including cancelled passes).
    fn on_migration_completed(&self, _summary: &MigrationSummary) {}
}

/// Cooperative cancellation handle.
///
/// Clones share the same flag. Runs check it between entries, never while
/// an entry is being written, so a cancelled run leaves the store resumable.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Hooks shared by every long-running operation.
#[derive(Clone, Default)]
pub struct RunContext<'a> {
    /// Optional progress receiver
    pub progress: Option<&'a dyn ProgressCallback>,
    /// Cancellation flag checked between entries
    pub cancel: CancelFlag,
}

impl<'a> RunContext<'a> {
    pub fn with_progress(progress: &'a dyn ProgressCallback) -> Self {
        RunContext {
            progress: Some(progress),
            cancel: CancelFlag::new(),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());

        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
