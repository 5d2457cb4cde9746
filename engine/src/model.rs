//! Core data model for storage-location migrations.
//!
//! This module defines the structures shared by indexing and migration:
//! - IndexEntry: one row of the index store, keyed by (entity id, version)
//! - EntityType, MigrationStatus, VersionStrategy: enums controlling behavior
//! - StatusCounts: the live tally reported by the store and the reporter

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of remote entity recorded in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// A versioned file entity
    File,
    /// A table entity whose versions are backed by file handles
    Table,
    /// A project or folder; structural only, never migrated
    Container,
}

impl EntityType {
    /// Canonical uppercase name, as stored on disk and exported to CSV.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::File => "FILE",
            EntityType::Table => "TABLE",
            EntityType::Container => "CONTAINER",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FILE" => Ok(EntityType::File),
            "TABLE" => Ok(EntityType::Table),
            "CONTAINER" => Ok(EntityType::Container),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

/// Migration status of a single index entry.
///
/// Legal transitions through the executor are `Indexed -> Migrated` and
/// `Indexed -> Errored`. `AlreadyMigrated` is terminal. `Errored` only moves
/// again when a fresh indexing pass overwrites the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    /// Recorded and waiting to be migrated
    Indexed,
    /// Storage location changed by the executor
    Migrated,
    /// Already stored at the destination when indexed
    AlreadyMigrated,
    /// Lookup or migration failed; see the exception message
    Errored,
}

impl MigrationStatus {
    /// Every status, in reporting order.
    pub const ALL: [MigrationStatus; 4] = [
        MigrationStatus::Indexed,
        MigrationStatus::Migrated,
        MigrationStatus::AlreadyMigrated,
        MigrationStatus::Errored,
    ];

    /// Canonical uppercase name, as stored on disk and exported to CSV.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Indexed => "INDEXED",
            MigrationStatus::Migrated => "MIGRATED",
            MigrationStatus::AlreadyMigrated => "ALREADY_MIGRATED",
            MigrationStatus::Errored => "ERRORED",
        }
    }

    /// Returns true if the executor may move an entry from `self` to `next`.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        matches!(
            (self, next),
            (MigrationStatus::Indexed, MigrationStatus::Migrated)
                | (MigrationStatus::Indexed, MigrationStatus::Errored)
        )
    }

    /// Returns true if no further executor transitions are possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MigrationStatus::Indexed)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INDEXED" => Ok(MigrationStatus::Indexed),
            "MIGRATED" => Ok(MigrationStatus::Migrated),
            "ALREADY_MIGRATED" => Ok(MigrationStatus::AlreadyMigrated),
            "ERRORED" => Ok(MigrationStatus::Errored),
            other => Err(format!("unknown migration status '{}'", other)),
        }
    }
}

/// Which versions of a file entity are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStrategy {
    /// Only the current version
    #[default]
    New,
    /// Every version of the entity
    All,
    /// Every version that already resolves to a file handle; others are skipped
    Existing,
}

impl fmt::Display for VersionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionStrategy::New => write!(f, "new"),
            VersionStrategy::All => write!(f, "all"),
            VersionStrategy::Existing => write!(f, "existing"),
        }
    }
}

impl FromStr for VersionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "new" => Ok(VersionStrategy::New),
            "all" => Ok(VersionStrategy::All),
            "existing" => Ok(VersionStrategy::Existing),
            other => Err(format!(
                "invalid version strategy '{}'. Must be 'new', 'all', or 'existing'",
                other
            )),
        }
    }
}

/// One row of the index store.
///
/// `(entity_id, version)` is unique within a store. Containers carry no
/// version and no destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Remote identifier of the entity
    pub entity_id: String,

    /// Version number, or `None` for container rows
    pub version: Option<u32>,

    /// Kind of entity
    pub entity_type: EntityType,

    /// Container the entity was found in (`None` for the walk root)
    pub parent_id: Option<String>,

    /// Storage location at index time
    pub from_storage_location_id: Option<String>,

    /// Migration target; fixed for the whole store
    pub to_storage_location_id: Option<String>,

    /// File handle backing this version, once resolved
    pub file_handle_id: Option<String>,

    /// Size in bytes as reported by the listing service
    pub file_size: Option<u64>,

    /// Current status
    pub status: MigrationStatus,

    /// Failure description; only set when `status` is `Errored`
    pub exception_message: Option<String>,

    /// Concurrency token captured at index time
    pub etag: Option<String>,
}

impl IndexEntry {
    /// The row key.
    pub fn key(&self) -> EntryKey {
        EntryKey {
            entity_id: self.entity_id.clone(),
            version: self.version,
        }
    }

    /// Build a structural row for a container.
    pub fn container(entity_id: impl Into<String>, parent_id: Option<String>) -> Self {
        IndexEntry {
            entity_id: entity_id.into(),
            version: None,
            entity_type: EntityType::Container,
            parent_id,
            from_storage_location_id: None,
            to_storage_location_id: None,
            file_handle_id: None,
            file_size: None,
            status: MigrationStatus::Indexed,
            exception_message: None,
            etag: None,
        }
    }
}

/// Primary key of an index entry.
///
/// Orders by entity id, then version, with the no-version sentinel first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub entity_id: String,
    pub version: Option<u32>,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Some(v) => write!(f, "{}.{}", self.entity_id, v),
            None => write!(f, "{}", self.entity_id),
        }
    }
}

/// Fields written alongside a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Replacement file handle, if the remote reported a new one
    pub file_handle_id: Option<String>,
    /// Failure description, required when moving to `Errored`
    pub exception_message: Option<String>,
}

/// Number of entries per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts(BTreeMap<MigrationStatus, u64>);

impl StatusCounts {
    /// Count for one status; absent statuses are zero.
    pub fn get(&self, status: MigrationStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    /// Overwrite the count for a status.
    pub fn set(&mut self, status: MigrationStatus, count: u64) {
        if count == 0 {
            self.0.remove(&status);
        } else {
            self.0.insert(status, count);
        }
    }

    /// Increment the count for a status.
    pub fn increment(&mut self, status: MigrationStatus) {
        *self.0.entry(status).or_insert(0) += 1;
    }

    /// Sum of every status.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// Iterate over non-zero counts in reporting order.
    pub fn iter(&self) -> impl Iterator<Item = (MigrationStatus, u64)> + '_ {
        self.0.iter().map(|(status, count)| (*status, *count))
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = MigrationStatus::ALL
            .iter()
            .map(|status| format!("{}: {}", status, self.get(*status)))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl<const N: usize> From<[(MigrationStatus, u64); N]> for StatusCounts {
    fn from(pairs: [(MigrationStatus, u64); N]) -> Self {
        let mut counts = StatusCounts::default();
        for (status, count) in pairs {
            counts.set(status, count);
        }
        counts
    }
}
