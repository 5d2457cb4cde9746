//! Indexing coordinator.
//!
//! Drives the hierarchy walker and turns every item it yields into a row of
//! the index store:
//! - candidates already at the destination become ALREADY_MIGRATED
//! - other candidates become INDEXED
//! - failed lookups become ERRORED, or abort the pass without continue-on-error
//!
//! Candidates outside the source filter never reach the store.

use chrono::{DateTime, Utc};
use std::path::Path;
use uuid::Uuid;

use crate::config::{IndexOptions, RetryPolicy};
use crate::error::{EngineError, EngineResult, RemoteError};
use crate::model::{EntityType, IndexEntry, MigrationStatus, StatusCounts};
use crate::parallel::map_batch;
use crate::progress::RunContext;
use crate::remote::{with_backoff, EntityHeader, EntityLister, VersionInfo};
use crate::store::{check_binding, IndexStore};
use crate::walker::{self, CandidateDescriptor, FailedLookup, WalkItem, WalkPolicy};

/// Outcome of an indexing pass.
#[derive(Debug, Clone)]
pub struct IndexingSummary {
    /// Identifier of this pass, for log correlation
    pub run_id: Uuid,
    pub root_id: String,
    pub destination_location_id: String,
    /// Live counts read from the store after the pass
    pub counts: StatusCounts,
    /// Rows written by this pass (containers excluded)
    pub written: u64,
    /// Candidates dropped by the source filter
    pub skipped_by_filter: u64,
    /// Rows recorded as ERRORED by this pass
    pub errors: u64,
    /// True if the pass stopped early on request
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IndexingSummary {
    fn start(options: &IndexOptions) -> Self {
        let now = Utc::now();
        IndexingSummary {
            run_id: Uuid::new_v4(),
            root_id: options.root_id.clone(),
            destination_location_id: options.destination_location_id.clone(),
            counts: StatusCounts::default(),
            written: 0,
            skipped_by_filter: 0,
            errors: 0,
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }
}

/// Index the hierarchy under `options.root_id` into the store at `path`,
/// creating the store if needed.
///
/// Checks run in this order, so configuration errors leave no trace:
/// options are validated, an existing store's binding is compared with the
/// requested root and destination, and the root is resolved remotely. Only
/// then is the store opened and the walk started.
///
/// # Errors
/// - `InvalidConfig` if the options fail validation
/// - `StoreConflict` if the file is bound to another root or destination
/// - `RootNotFound` if the root cannot be resolved
/// - `EntityFailed` on the first failed lookup when `continue_on_error` is false
pub fn index_files(
    lister: &dyn EntityLister,
    path: impl AsRef<Path>,
    options: &IndexOptions,
    ctx: &RunContext<'_>,
) -> EngineResult<IndexingSummary> {
    let path = path.as_ref();
    options.validate()?;

    if let Some(binding) = IndexStore::peek_binding(path)? {
        check_binding(path, &binding, &options.root_id, &options.destination_location_id)?;
    }

    let root = resolve_root(lister, options)?;
    let store =
        IndexStore::open_for_indexing(path, &options.root_id, &options.destination_location_id)?;
    walk_into(lister, &store, root, options, ctx)
}

/// Index into an already-open store. The store must be bound to the same
/// root and destination as `options`.
pub fn index_into(
    lister: &dyn EntityLister,
    store: &IndexStore,
    options: &IndexOptions,
    ctx: &RunContext<'_>,
) -> EngineResult<IndexingSummary> {
    options.validate()?;
    check_binding(
        store.path(),
        store.binding(),
        &options.root_id,
        &options.destination_location_id,
    )?;
    let root = resolve_root(lister, options)?;
    walk_into(lister, store, root, options, ctx)
}

/// Look up every ERRORED row again and re-classify it.
///
/// Version rows are resolved directly. Containers whose listing failed are
/// walked again from that container down. Rows that resolve to a location
/// outside the source filter stay ERRORED with an explanatory message.
pub fn reindex_errored(
    lister: &dyn EntityLister,
    store: &IndexStore,
    options: &IndexOptions,
    ctx: &RunContext<'_>,
) -> EngineResult<IndexingSummary> {
    options.validate()?;
    check_binding(
        store.path(),
        store.binding(),
        &options.root_id,
        &options.destination_location_id,
    )?;

    let mut recorder = Recorder::new(store, options, ctx);
    tracing::info!(
        run_id = %recorder.summary.run_id,
        root_id = %options.root_id,
        "re-indexing errored entries"
    );

    // Placeholder rows are re-keyed when refreshed, so the errored set is
    // read up front rather than paged while it is being rewritten.
    let errored = store
        .get_by_status(MigrationStatus::Errored)
        .collect::<EngineResult<Vec<_>>>()?;
    for batch in errored.chunks(options.concurrency) {
        if ctx.is_cancelled() {
            recorder.summary.cancelled = true;
            break;
        }
        recorder.refresh_batch(lister, batch)?;
    }

    for container in store.containers_with_status(MigrationStatus::Errored)? {
        if recorder.summary.cancelled || ctx.is_cancelled() {
            recorder.summary.cancelled = true;
            break;
        }
        let header = match with_backoff(&options.retry, "get_entity", || {
            lister.get_entity(&container.entity_id)
        }) {
            Ok(header) => header,
            Err(error) => {
                recorder.record(WalkItem::Failed(FailedLookup {
                    entity_id: container.entity_id.clone(),
                    version: None,
                    entity_type: EntityType::Container,
                    parent_id: container.parent_id.clone(),
                    error,
                }))?;
                continue;
            }
        };
        recorder.record_walk(lister, header, container.parent_id.clone())?;
    }

    recorder.finish()
}

fn resolve_root(lister: &dyn EntityLister, options: &IndexOptions) -> EngineResult<EntityHeader> {
    with_backoff(&options.retry, "get_entity", || lister.get_entity(&options.root_id)).map_err(
        |source| {
            tracing::error!(root_id = %options.root_id, error = %source, "root entity could not be resolved");
            EngineError::RootNotFound {
                root_id: options.root_id.clone(),
                source,
            }
        },
    )
}

fn walk_into(
    lister: &dyn EntityLister,
    store: &IndexStore,
    root: EntityHeader,
    options: &IndexOptions,
    ctx: &RunContext<'_>,
) -> EngineResult<IndexingSummary> {
    let mut recorder = Recorder::new(store, options, ctx);

    tracing::info!(
        run_id = %recorder.summary.run_id,
        root_id = %options.root_id,
        destination = %options.destination_location_id,
        version_strategy = %options.version_strategy,
        include_tables = options.include_table_entities,
        "indexing started"
    );
    if let Some(progress) = ctx.progress {
        progress.on_index_started(&options.root_id, &options.destination_location_id);
    }

    recorder.record_walk(lister, root, None)?;
    recorder.finish()
}

fn walk_policy(options: &IndexOptions) -> WalkPolicy {
    WalkPolicy {
        version_strategy: options.version_strategy,
        include_table_entities: options.include_table_entities,
        source_location_ids: options.source_location_ids.clone(),
        target_location_id: Some(options.destination_location_id.clone()),
        concurrency: options.concurrency,
        retry: options.retry.clone(),
    }
}

fn parent_slot(item: &mut WalkItem) -> &mut Option<String> {
    match item {
        WalkItem::Container(container) => &mut container.parent_id,
        WalkItem::Candidate(candidate) => &mut candidate.parent_id,
        WalkItem::Failed(failed) => &mut failed.parent_id,
    }
}

/// Initial status of a resolved candidate.
fn classify(location: Option<&str>, destination_location_id: &str) -> MigrationStatus {
    if location == Some(destination_location_id) {
        MigrationStatus::AlreadyMigrated
    } else {
        MigrationStatus::Indexed
    }
}

fn candidate_entry(candidate: CandidateDescriptor, destination_location_id: &str) -> IndexEntry {
    let status = classify(candidate.storage_location_id.as_deref(), destination_location_id);
    IndexEntry {
        entity_id: candidate.entity_id,
        version: Some(candidate.version),
        entity_type: candidate.entity_type,
        parent_id: candidate.parent_id,
        from_storage_location_id: candidate.storage_location_id,
        to_storage_location_id: Some(destination_location_id.to_string()),
        file_handle_id: candidate.file_handle_id,
        file_size: candidate.file_size,
        status,
        exception_message: None,
        etag: candidate.etag,
    }
}

fn failed_entry(failed: &FailedLookup) -> IndexEntry {
    IndexEntry {
        entity_id: failed.entity_id.clone(),
        version: failed.version,
        entity_type: failed.entity_type,
        parent_id: failed.parent_id.clone(),
        from_storage_location_id: None,
        to_storage_location_id: None,
        file_handle_id: None,
        file_size: None,
        status: MigrationStatus::Errored,
        exception_message: Some(failed.error.to_string()),
        etag: None,
    }
}

/// Writes walk results to the store and keeps the tally.
struct Recorder<'s, 'c> {
    store: &'s IndexStore,
    options: &'s IndexOptions,
    ctx: &'s RunContext<'c>,
    summary: IndexingSummary,
}

impl<'s, 'c> Recorder<'s, 'c> {
    fn new(store: &'s IndexStore, options: &'s IndexOptions, ctx: &'s RunContext<'c>) -> Self {
        Recorder {
            store,
            options,
            ctx,
            summary: IndexingSummary::start(options),
        }
    }

    fn record_walk(
        &mut self,
        lister: &dyn EntityLister,
        root: EntityHeader,
        parent_id: Option<String>,
    ) -> EngineResult<()> {
        let mut walk = walker::walk(lister, root, walk_policy(self.options), self.ctx.cancel.clone());
        for mut item in walk.by_ref() {
            // The walker only knows parents below its own root
            let slot = parent_slot(&mut item);
            if slot.is_none() {
                *slot = parent_id.clone();
            }
            self.record(item)?;
        }

        let stats = walk.stats();
        self.summary.skipped_by_filter += stats.skipped_by_filter;
        if walk.was_cancelled() {
            self.summary.cancelled = true;
        }
        Ok(())
    }

    fn record(&mut self, item: WalkItem) -> EngineResult<()> {
        let entry = match item {
            WalkItem::Container(container) => {
                let entry = IndexEntry::container(container.entity_id, container.parent_id);
                self.store.upsert(&entry)?;
                tracing::debug!(entity_id = %entry.entity_id, "container indexed");
                return Ok(());
            }
            WalkItem::Candidate(candidate) => {
                candidate_entry(candidate, &self.options.destination_location_id)
            }
            WalkItem::Failed(failed) => {
                if !self.options.continue_on_error {
                    tracing::error!(
                        entity_id = %failed.entity_id,
                        version = ?failed.version,
                        error = %failed.error,
                        "lookup failed, aborting indexing pass"
                    );
                    return Err(EngineError::EntityFailed {
                        entity_id: failed.entity_id,
                        version: failed.version,
                        source: failed.error,
                    });
                }
                tracing::warn!(
                    entity_id = %failed.entity_id,
                    version = ?failed.version,
                    error = %failed.error,
                    "lookup failed, recording as errored"
                );
                failed_entry(&failed)
            }
        };
        self.write(entry, None)
    }

    /// Upsert a non-container row, or swap it for a placeholder row.
    fn write(&mut self, entry: IndexEntry, placeholder_of: Option<&str>) -> EngineResult<()> {
        match placeholder_of {
            Some(entity_id) => self.store.replace_placeholder(entity_id, &entry)?,
            None => self.store.upsert(&entry)?,
        }
        self.summary.written += 1;
        if entry.status == MigrationStatus::Errored {
            self.summary.errors += 1;
        }
        tracing::debug!(
            entity_id = %entry.entity_id,
            version = ?entry.version,
            status = %entry.status,
            "entry indexed"
        );
        if let Some(progress) = self.ctx.progress {
            progress.on_entry_indexed(&entry);
        }
        Ok(())
    }

    /// Look up a batch of ERRORED rows in parallel and commit the new
    /// classification in key order.
    fn refresh_batch(&mut self, lister: &dyn EntityLister, batch: &[IndexEntry]) -> EngineResult<()> {
        let retry = &self.options.retry;
        let results = map_batch(batch, |entry| refresh_lookup(lister, retry, entry));

        for (previous, result) in batch.iter().zip(results) {
            let placeholder_of = match previous.version {
                None => Some(previous.entity_id.as_str()),
                Some(_) => None,
            };
            let (version, info) = match result {
                Ok(resolved) => resolved,
                Err(error) => {
                    self.record(WalkItem::Failed(FailedLookup {
                        entity_id: previous.entity_id.clone(),
                        version: previous.version,
                        entity_type: previous.entity_type,
                        parent_id: previous.parent_id.clone(),
                        error,
                    }))?;
                    continue;
                }
            };

            let location = info.storage_location_id.as_deref();
            let destination = self.options.destination_location_id.as_str();
            let entry = if location != Some(destination) && !self.options.accepts_source(location) {
                IndexEntry {
                    exception_message: Some(format!(
                        "storage location {} is outside the source filter",
                        location.unwrap_or("<none>")
                    )),
                    ..refreshed_entry(previous, version, info, MigrationStatus::Errored, destination)
                }
            } else {
                let status = classify(location, destination);
                refreshed_entry(previous, version, info, status, destination)
            };
            self.write(entry, placeholder_of)?;
        }
        Ok(())
    }

    fn finish(mut self) -> EngineResult<IndexingSummary> {
        self.summary.counts = self.store.counts()?;
        self.summary.finished_at = Utc::now();

        tracing::info!(
            run_id = %self.summary.run_id,
            written = self.summary.written,
            errors = self.summary.errors,
            skipped_by_filter = self.summary.skipped_by_filter,
            cancelled = self.summary.cancelled,
            counts = %self.summary.counts,
            "indexing finished"
        );
        if let Some(progress) = self.ctx.progress {
            progress.on_index_completed(&self.summary);
        }
        Ok(self.summary)
    }
}

fn refresh_lookup(
    lister: &dyn EntityLister,
    retry: &RetryPolicy,
    entry: &IndexEntry,
) -> Result<(u32, VersionInfo), RemoteError> {
    let version = match entry.version {
        Some(version) => version,
        None => {
            let header = with_backoff(retry, "get_entity", || lister.get_entity(&entry.entity_id))?;
            match header.current_version {
                Some(version) => version,
                None => walker::list_all_versions(lister, retry, &entry.entity_id)?
                    .into_iter()
                    .max()
                    .ok_or_else(|| {
                        RemoteError::Other(format!("no versions reported for {}", entry.entity_id))
                    })?,
            }
        }
    };
    let info = with_backoff(retry, "get_version", || lister.get_version(&entry.entity_id, version))?;
    Ok((version, info))
}

fn refreshed_entry(
    previous: &IndexEntry,
    version: u32,
    info: VersionInfo,
    status: MigrationStatus,
    destination_location_id: &str,
) -> IndexEntry {
    IndexEntry {
        entity_id: previous.entity_id.clone(),
        version: Some(version),
        entity_type: previous.entity_type,
        parent_id: previous.parent_id.clone(),
        from_storage_location_id: info.storage_location_id,
        to_storage_location_id: Some(destination_location_id.to_string()),
        file_handle_id: info.file_handle_id,
        file_size: info.file_size,
        status,
        exception_message: None,
        etag: info.etag,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(location: Option<&str>) -> CandidateDescriptor {
        CandidateDescriptor {
            entity_id: "syn10".to_string(),
            version: 2,
            entity_type: EntityType::File,
            parent_id: Some("syn1".to_string()),
            storage_location_id: location.map(|l| l.to_string()),
            file_handle_id: Some("fh".to_string()),
            etag: Some("etag".to_string()),
            file_size: Some(42),
        }
    }

    #[test]
    fn test_classify_candidate_at_destination() {
        let entry = candidate_entry(candidate(Some("9001")), "9001");
        assert_eq!(entry.status, MigrationStatus::AlreadyMigrated);
        assert_eq!(entry.to_storage_location_id.as_deref(), Some("9001"));
    }

    #[test]
    fn test_classify_candidate_elsewhere() {
        assert_eq!(
            candidate_entry(candidate(Some("1")), "9001").status,
            MigrationStatus::Indexed
        );
        assert_eq!(candidate_entry(candidate(None), "9001").status, MigrationStatus::Indexed);
    }

    #[test]
    fn test_failed_entry_keeps_message() {
        let failed = FailedLookup {
            entity_id: "syn10".to_string(),
            version: Some(3),
            entity_type: EntityType::File,
            parent_id: None,
            error: RemoteError::Timeout("get_version".to_string()),
        };
        let entry = failed_entry(&failed);
        assert_eq!(entry.status, MigrationStatus::Errored);
        assert_eq!(entry.version, Some(3));
        assert_eq!(entry.exception_message.as_deref(), Some("request timed out: get_version"));
    }

    #[test]
    fn test_walk_policy_targets_destination() {
        let mut options = IndexOptions::new("syn1", "9001");
        options.concurrency = 8;
        let policy = walk_policy(&options);
        assert_eq!(policy.target_location_id.as_deref(), Some("9001"));
        assert_eq!(policy.concurrency, 8);
        assert!(policy.source_location_ids.is_none());
    }
}
