pub mod fake_remote;

#[allow(unused_imports)]
pub use fake_remote::{FakeRemote, MoveCall};

use relocate_engine::{IndexEntry, IndexingSummary, MigrationSummary, ProgressCallback, RetryPolicy};
use std::sync::Mutex;

/// Retry policy with millisecond delays so throttling tests stay fast.
#[allow(dead_code)]
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 4,
        multiplier: 2.0,
    }
}

/// Progress receiver that remembers what it was told.
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingProgress {
    pub indexed: Mutex<Vec<IndexEntry>>,
    pub migrated: Mutex<Vec<IndexEntry>>,
    pub migration_started: Mutex<Option<u64>>,
    pub index_completed: Mutex<bool>,
    pub migration_completed: Mutex<bool>,
}

impl ProgressCallback for RecordingProgress {
    fn on_entry_indexed(&self, entry: &IndexEntry) {
        self.indexed.lock().unwrap().push(entry.clone());
    }

    fn on_index_completed(&self, _summary: &IndexingSummary) {
        *self.index_completed.lock().unwrap() = true;
    }

    fn on_migration_started(&self, pending: u64) {
        *self.migration_started.lock().unwrap() = Some(pending);
    }

    fn on_entry_migrated(&self, entry: &IndexEntry) {
        self.migrated.lock().unwrap().push(entry.clone());
    }

    fn on_migration_completed(&self, _summary: &MigrationSummary) {
        *self.migration_completed.lock().unwrap() = true;
    }
}
