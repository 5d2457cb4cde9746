//! Migration executor.
//!
//! Reads INDEXED rows in key order, asks the storage mutator to re-point each
//! version at the store's destination, and commits every outcome as its own
//! transaction. Moves are issued one at a time so the remote sees them in key
//! order; a crash or cancellation loses at most the row in flight, and
//! re-running picks up the rows that are still INDEXED.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::config::{MigrateOptions, RetryPolicy};
use crate::error::{EngineError, EngineResult, RemoteError};
use crate::model::{EntityType, IndexEntry, MigrationStatus, StatusCounts, StatusUpdate};
use crate::progress::RunContext;
use crate::remote::{with_backoff, MoveOutcome, MoveRequest, StorageMutator};
use crate::store::IndexStore;

/// What the operator is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPreview {
    pub destination_location_id: String,
    /// Rows that will be moved
    pub pending: u64,
    /// Live counts at the time of the prompt
    pub counts: StatusCounts,
}

/// Confirmation capability consulted before any remote mutation.
pub trait Confirm {
    /// Returns true to proceed.
    fn confirm(&self, preview: &MigrationPreview) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&MigrationPreview) -> bool,
{
    fn confirm(&self, preview: &MigrationPreview) -> bool {
        self(preview)
    }
}

/// A table snapshot that could not be taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFailure {
    pub table_id: String,
    pub error: RemoteError,
}

/// Outcome of a migration pass.
#[derive(Debug, Clone)]
pub struct MigrationSummary {
    /// Identifier of this pass, for log correlation
    pub run_id: Uuid,
    pub destination_location_id: String,
    /// Rows moved to MIGRATED by this pass
    pub migrated: u64,
    /// Rows moved to ERRORED by this pass
    pub errored: u64,
    /// Table snapshots taken by this pass
    pub snapshots: u64,
    pub snapshot_failures: Vec<SnapshotFailure>,
    /// Live counts read from the store after the pass
    pub counts: StatusCounts,
    /// True if the pass stopped early on request
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MigrationSummary {
    fn start(destination_location_id: &str) -> Self {
        let now = Utc::now();
        MigrationSummary {
            run_id: Uuid::new_v4(),
            destination_location_id: destination_location_id.to_string(),
            migrated: 0,
            errored: 0,
            snapshots: 0,
            snapshot_failures: Vec::new(),
            counts: StatusCounts::default(),
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }
}

/// Migrate every INDEXED row of `store` to the store's destination.
///
/// Unless `options.force` is set, `confirm` must approve the preview first;
/// a missing or declining confirmer fails with `ConfirmationRequired` before
/// anything is changed. With nothing pending, no confirmation is requested.
///
/// Rows are moved and committed one at a time in ascending
/// (entity id, version) order; each move finishes before the next starts.
///
/// # Errors
/// - `InvalidConfig` if the options fail validation
/// - `ConfirmationRequired` if the run was not confirmed
/// - `EntityFailed` for the first failed row when `continue_on_error` is false;
///   the failed row is committed as ERRORED first
pub fn migrate_indexed(
    mutator: &dyn StorageMutator,
    store: &IndexStore,
    options: &MigrateOptions,
    confirm: Option<&dyn Confirm>,
    ctx: &RunContext<'_>,
) -> EngineResult<MigrationSummary> {
    options.validate()?;

    let destination = store.destination_location_id().to_string();
    let mut summary = MigrationSummary::start(&destination);
    let counts = store.counts()?;
    let pending = counts.get(MigrationStatus::Indexed);

    if pending == 0 {
        tracing::info!(run_id = %summary.run_id, counts = %counts, "nothing to migrate");
        summary.counts = counts;
        return Ok(summary);
    }

    if !options.force {
        let preview = MigrationPreview {
            destination_location_id: destination.clone(),
            pending,
            counts,
        };
        let confirmed = confirm.map(|c| c.confirm(&preview)).unwrap_or(false);
        if !confirmed {
            tracing::info!(pending, "migration not confirmed");
            return Err(EngineError::ConfirmationRequired { pending });
        }
    }

    tracing::info!(
        run_id = %summary.run_id,
        destination = %destination,
        pending,
        "migration started"
    );
    if let Some(progress) = ctx.progress {
        progress.on_migration_started(pending);
    }

    let mut migrated_tables = BTreeSet::new();
    let mut failure = None;

    for entry in store.get_by_status(MigrationStatus::Indexed) {
        if ctx.is_cancelled() {
            tracing::info!(run_id = %summary.run_id, "migration cancelled");
            summary.cancelled = true;
            break;
        }
        let entry = entry?;

        let updated = match move_entry(mutator, &options.retry, &destination, &entry) {
            Ok(moved) => {
                let updated = store.set_status(
                    &entry.entity_id,
                    entry.version,
                    MigrationStatus::Migrated,
                    StatusUpdate {
                        file_handle_id: moved.file_handle_id,
                        exception_message: None,
                    },
                )?;
                summary.migrated += 1;
                if entry.entity_type == EntityType::Table {
                    migrated_tables.insert(entry.entity_id.clone());
                }
                tracing::debug!(entity_id = %entry.entity_id, version = ?entry.version, "entry migrated");
                updated
            }
            Err(error) => {
                tracing::warn!(
                    entity_id = %entry.entity_id,
                    version = ?entry.version,
                    error = %error,
                    "migration of entry failed"
                );
                let updated = store.set_status(
                    &entry.entity_id,
                    entry.version,
                    MigrationStatus::Errored,
                    StatusUpdate {
                        file_handle_id: None,
                        exception_message: Some(error.to_string()),
                    },
                )?;
                summary.errored += 1;
                if !options.continue_on_error {
                    failure = Some(EngineError::EntityFailed {
                        entity_id: entry.entity_id.clone(),
                        version: entry.version,
                        source: error,
                    });
                }
                updated
            }
        };

        if let Some(progress) = ctx.progress {
            progress.on_entry_migrated(&updated);
        }
        if failure.is_some() {
            break;
        }
    }

    if options.create_table_snapshots {
        snapshot_tables(mutator, &options.retry, &migrated_tables, &mut summary);
    }

    summary.counts = store.counts()?;
    summary.finished_at = Utc::now();

    if let Some(err) = failure {
        tracing::error!(
            run_id = %summary.run_id,
            error = %err,
            counts = %summary.counts,
            "migration aborted"
        );
        return Err(err);
    }

    tracing::info!(
        run_id = %summary.run_id,
        migrated = summary.migrated,
        errored = summary.errored,
        snapshots = summary.snapshots,
        cancelled = summary.cancelled,
        counts = %summary.counts,
        "migration finished"
    );
    if let Some(progress) = ctx.progress {
        progress.on_migration_completed(&summary);
    }
    Ok(summary)
}

fn move_entry(
    mutator: &dyn StorageMutator,
    retry: &RetryPolicy,
    destination_location_id: &str,
    entry: &IndexEntry,
) -> Result<MoveOutcome, RemoteError> {
    let version = entry.version.ok_or_else(|| {
        RemoteError::Other(format!("entry {} has no version to migrate", entry.entity_id))
    })?;
    let request = MoveRequest {
        entity_id: entry.entity_id.clone(),
        version,
        destination_location_id: destination_location_id.to_string(),
        file_handle_id: entry.file_handle_id.clone(),
        etag: entry.etag.clone(),
    };
    with_backoff(retry, "move_version", || mutator.move_version(&request))
}

/// Snapshot each table once. Failures are collected, not fatal: the moved
/// rows are already committed and carry no snapshot state of their own.
fn snapshot_tables(
    mutator: &dyn StorageMutator,
    retry: &RetryPolicy,
    tables: &BTreeSet<String>,
    summary: &mut MigrationSummary,
) {
    for table_id in tables {
        match with_backoff(retry, "snapshot_table", || mutator.snapshot_table(table_id)) {
            Ok(outcome) => {
                tracing::info!(
                    table_id = %table_id,
                    snapshot_version = ?outcome.snapshot_version,
                    "table snapshot created"
                );
                summary.snapshots += 1;
            }
            Err(error) => {
                tracing::warn!(table_id = %table_id, error = %error, "table snapshot failed");
                summary.snapshot_failures.push(SnapshotFailure {
                    table_id: table_id.clone(),
                    error,
                });
            }
        }
    }
}
