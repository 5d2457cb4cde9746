//! Hierarchy walker.
//!
//! Enumerates a project or folder depth-first through the listing
//! collaborator and yields one item per container, per candidate version and
//! per failed lookup. Containers are tracked on an explicit stack rather than
//! by recursion, and listings are consumed page by page, so memory stays
//! bounded by the depth of the tree and one page per level.

use std::collections::{BTreeSet, VecDeque};

use crate::config::RetryPolicy;
use crate::error::RemoteError;
use crate::model::{EntityType, VersionStrategy};
use crate::parallel::map_batch;
use crate::progress::CancelFlag;
use crate::remote::{with_backoff, EntityHeader, EntityLister, RemoteKind, VersionInfo};

/// What the walker emits and how it filters.
#[derive(Debug, Clone)]
pub struct WalkPolicy {
    /// Which file versions to emit
    pub version_strategy: VersionStrategy,
    /// Emit table entities (current version only); otherwise skip them
    pub include_table_entities: bool,
    /// Only emit candidates stored in one of these locations
    pub source_location_ids: Option<BTreeSet<String>>,
    /// Candidates already stored here are emitted regardless of the source filter
    pub target_location_id: Option<String>,
    /// Version lookups resolved in parallel
    pub concurrency: usize,
    /// Backoff for throttled listing and lookup calls
    pub retry: RetryPolicy,
}

impl Default for WalkPolicy {
    fn default() -> Self {
        WalkPolicy {
            version_strategy: VersionStrategy::New,
            include_table_entities: false,
            source_location_ids: None,
            target_location_id: None,
            concurrency: 1,
            retry: RetryPolicy::none(),
        }
    }
}

/// A container found during the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub entity_id: String,
    pub parent_id: Option<String>,
}

/// One entity version eligible for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDescriptor {
    pub entity_id: String,
    pub version: u32,
    pub entity_type: EntityType,
    pub parent_id: Option<String>,
    pub storage_location_id: Option<String>,
    pub file_handle_id: Option<String>,
    pub etag: Option<String>,
    pub file_size: Option<u64>,
}

/// A listing or version lookup that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedLookup {
    pub entity_id: String,
    pub version: Option<u32>,
    pub entity_type: EntityType,
    pub parent_id: Option<String>,
    pub error: RemoteError,
}

/// Item produced by the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkItem {
    Container(ContainerDescriptor),
    Candidate(CandidateDescriptor),
    Failed(FailedLookup),
}

/// Counters for entities the walk chose not to emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Candidates outside the source filter
    pub skipped_by_filter: u64,
    /// Entities of a kind that is not indexed (links, disabled tables, ...)
    pub skipped_by_kind: u64,
    /// Versions without a resolvable file handle under the `existing` strategy
    pub skipped_unresolved: u64,
}

/// A version waiting for its storage details.
#[derive(Debug, Clone)]
struct VersionRef {
    entity_id: String,
    version: u32,
    entity_type: EntityType,
    parent_id: Option<String>,
}

enum Pending {
    Ready(WalkItem),
    Lookup(VersionRef),
}

/// Listing position inside one container.
struct ContainerCursor {
    id: String,
    parent_id: Option<String>,
    children: VecDeque<EntityHeader>,
    next_page_token: Option<String>,
    listed_once: bool,
}

impl ContainerCursor {
    fn new(id: String, parent_id: Option<String>) -> Self {
        ContainerCursor {
            id,
            parent_id,
            children: VecDeque::new(),
            next_page_token: None,
            listed_once: false,
        }
    }

    fn has_more_pages(&self) -> bool {
        !self.listed_once || self.next_page_token.is_some()
    }
}

/// Walk the hierarchy under `root`.
///
/// The root header must already be resolved; a root that is a file or a
/// table yields that single entity.
pub fn walk<'a>(
    lister: &'a dyn EntityLister,
    root: EntityHeader,
    policy: WalkPolicy,
    cancel: CancelFlag,
) -> Walk<'a> {
    let mut walk = Walk {
        lister,
        policy,
        cancel,
        stack: Vec::new(),
        pending: VecDeque::new(),
        output: VecDeque::new(),
        stats: WalkStats::default(),
        cancelled: false,
    };
    walk.visit(root, None);
    walk
}

/// Lazy walk over a hierarchy. See [`walk`].
pub struct Walk<'a> {
    lister: &'a dyn EntityLister,
    policy: WalkPolicy,
    cancel: CancelFlag,
    stack: Vec<ContainerCursor>,
    pending: VecDeque<Pending>,
    output: VecDeque<WalkItem>,
    stats: WalkStats,
    cancelled: bool,
}

impl Walk<'_> {
    pub fn stats(&self) -> WalkStats {
        self.stats
    }

    /// True if the walk stopped early because the cancel flag was raised.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Queue an entity found in `parent` (or the root, when `parent` is None).
    fn visit(&mut self, entity: EntityHeader, parent: Option<String>) {
        match entity.kind {
            RemoteKind::Project | RemoteKind::Folder => {
                self.pending.push_back(Pending::Ready(WalkItem::Container(ContainerDescriptor {
                    entity_id: entity.id.clone(),
                    parent_id: parent.clone(),
                })));
                self.stack.push(ContainerCursor::new(entity.id, parent));
            }
            RemoteKind::File => self.queue_versions(entity, EntityType::File, parent),
            RemoteKind::Table if self.policy.include_table_entities => {
                self.queue_versions(entity, EntityType::Table, parent)
            }
            RemoteKind::Table | RemoteKind::Other => {
                tracing::debug!(entity_id = %entity.id, kind = ?entity.kind, "skipping entity kind");
                self.stats.skipped_by_kind += 1;
            }
        }
    }

    fn queue_versions(&mut self, entity: EntityHeader, entity_type: EntityType, parent: Option<String>) {
        let versions = match (entity_type, self.policy.version_strategy, entity.current_version) {
            (EntityType::File, VersionStrategy::All | VersionStrategy::Existing, _) => {
                list_all_versions(self.lister, &self.policy.retry, &entity.id)
            }
            (_, _, Some(current)) => Ok(vec![current]),
            // Listing did not report a current version; take the newest listed one
            (_, _, None) => list_all_versions(self.lister, &self.policy.retry, &entity.id)
                .map(|versions| versions.into_iter().max().into_iter().collect()),
        };

        match versions {
            Ok(versions) if !versions.is_empty() => {
                for version in versions {
                    self.pending.push_back(Pending::Lookup(VersionRef {
                        entity_id: entity.id.clone(),
                        version,
                        entity_type,
                        parent_id: parent.clone(),
                    }));
                }
            }
            result => {
                let error = match result {
                    Err(error) => error,
                    Ok(_) => RemoteError::Other(format!("no versions reported for {}", entity.id)),
                };
                self.pending.push_back(Pending::Ready(WalkItem::Failed(FailedLookup {
                    entity_id: entity.id,
                    version: entity.current_version,
                    entity_type,
                    parent_id: parent,
                    error,
                })));
            }
        }
    }

    /// Advance the enumeration by one child. Returns false once every
    /// container has been fully listed.
    fn enumerate_step(&mut self) -> bool {
        let Some(cursor) = self.stack.last_mut() else {
            return false;
        };

        if cursor.children.is_empty() && cursor.has_more_pages() {
            let container_id = cursor.id.clone();
            let parent_id = cursor.parent_id.clone();
            let token = cursor.next_page_token.take();
            let lister = self.lister;
            let listed = with_backoff(&self.policy.retry, "list_children", || {
                lister.list_children(&container_id, token.as_deref())
            });
            match listed {
                Ok(page) => {
                    cursor.listed_once = true;
                    cursor.next_page_token = page.next_page_token;
                    cursor.children.extend(page.children);
                }
                Err(error) => {
                    tracing::warn!(container_id = %container_id, %error, "container listing failed");
                    self.stack.pop();
                    self.pending.push_back(Pending::Ready(WalkItem::Failed(FailedLookup {
                        entity_id: container_id,
                        version: None,
                        entity_type: EntityType::Container,
                        parent_id,
                        error,
                    })));
                }
            }
            return true;
        }

        let parent = cursor.id.clone();
        match cursor.children.pop_front() {
            Some(child) => self.visit(child, Some(parent)),
            None => {
                self.stack.pop();
            }
        }
        true
    }

    fn pending_lookups(&self) -> usize {
        self.pending
            .iter()
            .filter(|item| matches!(item, Pending::Lookup(_)))
            .count()
    }

    /// Move the front of the pending queue to the output, resolving up to
    /// `concurrency` version lookups in parallel.
    fn resolve_front(&mut self) {
        let limit = self.policy.concurrency.max(1);
        let mut batch = Vec::new();
        let mut order = Vec::new();

        while let Some(item) = self.pending.front() {
            if matches!(item, Pending::Lookup(_)) && batch.len() == limit {
                break;
            }
            match self.pending.pop_front() {
                Some(Pending::Ready(item)) => order.push(Some(item)),
                Some(Pending::Lookup(version_ref)) => {
                    batch.push(version_ref);
                    order.push(None);
                }
                None => break,
            }
        }

        let lister = self.lister;
        let retry = &self.policy.retry;
        let resolved = map_batch(&batch, |version_ref| {
            with_backoff(retry, "get_version", || {
                lister.get_version(&version_ref.entity_id, version_ref.version)
            })
        });

        let mut resolved = batch.into_iter().zip(resolved);
        for slot in order {
            let item = match slot {
                Some(item) => Some(item),
                None => match resolved.next() {
                    Some((version_ref, result)) => self.describe(version_ref, result),
                    None => None,
                },
            };
            if let Some(item) = item {
                self.output.push_back(item);
            }
        }
    }

    fn describe(
        &mut self,
        version_ref: VersionRef,
        result: Result<VersionInfo, RemoteError>,
    ) -> Option<WalkItem> {
        let info = match result {
            Ok(info) => info,
            Err(error) => {
                return Some(WalkItem::Failed(FailedLookup {
                    entity_id: version_ref.entity_id,
                    version: Some(version_ref.version),
                    entity_type: version_ref.entity_type,
                    parent_id: version_ref.parent_id,
                    error,
                }));
            }
        };

        if self.policy.version_strategy == VersionStrategy::Existing
            && version_ref.entity_type == EntityType::File
            && info.file_handle_id.is_none()
        {
            self.stats.skipped_unresolved += 1;
            return None;
        }

        if !self.passes_source_filter(info.storage_location_id.as_deref()) {
            self.stats.skipped_by_filter += 1;
            return None;
        }

        Some(WalkItem::Candidate(CandidateDescriptor {
            entity_id: version_ref.entity_id,
            version: version_ref.version,
            entity_type: version_ref.entity_type,
            parent_id: version_ref.parent_id,
            storage_location_id: info.storage_location_id,
            file_handle_id: info.file_handle_id,
            etag: info.etag,
            file_size: info.file_size,
        }))
    }

    fn passes_source_filter(&self, location: Option<&str>) -> bool {
        let Some(sources) = &self.policy.source_location_ids else {
            return true;
        };
        match location {
            Some(location) => {
                sources.contains(location)
                    || self.policy.target_location_id.as_deref() == Some(location)
            }
            None => false,
        }
    }
}

/// Every version number of `entity_id`, ascending, following pagination.
pub(crate) fn list_all_versions(
    lister: &dyn EntityLister,
    retry: &RetryPolicy,
    entity_id: &str,
) -> Result<Vec<u32>, RemoteError> {
    let mut versions = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = with_backoff(retry, "list_versions", || {
            lister.list_versions(entity_id, token.as_deref())
        })?;
        versions.extend(page.versions);
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    versions.sort_unstable();
    versions.dedup();
    Ok(versions)
}

impl Iterator for Walk<'_> {
    type Item = WalkItem;

    fn next(&mut self) -> Option<WalkItem> {
        loop {
            if let Some(item) = self.output.pop_front() {
                return Some(item);
            }
            if self.cancel.is_cancelled() {
                self.cancelled = true;
                return None;
            }

            let limit = self.policy.concurrency.max(1);
            while self.pending_lookups() < limit && self.enumerate_step() {}

            if self.pending.is_empty() {
                return None;
            }
            self.resolve_front();
        }
    }
}
