//! Remote collaborator interfaces.
//!
//! The engine never talks to the storage service directly. Every operation
//! receives an explicit handle implementing `EntityLister` (indexing) or
//! `StorageMutator` (migration), so the session and transport live with the
//! caller.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RetryPolicy;
use crate::error::RemoteError;

/// Kind of entity as reported by the listing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    Project,
    Folder,
    File,
    Table,
    /// Anything the engine does not migrate (links, views, ...)
    #[serde(other)]
    Other,
}

impl RemoteKind {
    pub fn is_container(&self) -> bool {
        matches!(self, RemoteKind::Project | RemoteKind::Folder)
    }
}

/// Minimal description of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityHeader {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: RemoteKind,
    /// Current version number; `None` for containers
    #[serde(default)]
    pub current_version: Option<u32>,
}

/// One page of a container listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildPage {
    pub children: Vec<EntityHeader>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// One page of an entity's version numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPage {
    pub versions: Vec<u32>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Storage details of one entity version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub file_handle_id: Option<String>,
    #[serde(default)]
    pub storage_location_id: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Read side of the remote service.
pub trait EntityLister: Send + Sync {
    /// Resolve a single entity.
    fn get_entity(&self, entity_id: &str) -> Result<EntityHeader, RemoteError>;

    /// List the direct children of a project or folder.
    fn list_children(
        &self,
        container_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, RemoteError>;

    /// List the version numbers of a file or table.
    fn list_versions(
        &self,
        entity_id: &str,
        page_token: Option<&str>,
    ) -> Result<VersionPage, RemoteError>;

    /// Storage details of one version.
    fn get_version(&self, entity_id: &str, version: u32) -> Result<VersionInfo, RemoteError>;
}

/// A metadata-level storage move for one entity version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveRequest {
    pub entity_id: String,
    pub version: u32,
    pub destination_location_id: String,
    pub file_handle_id: Option<String>,
    pub etag: Option<String>,
}

/// Result of a successful move.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MoveOutcome {
    /// File handle now backing the version, if the service issued a new one
    #[serde(default)]
    pub file_handle_id: Option<String>,
}

/// Result of a table snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SnapshotOutcome {
    #[serde(default)]
    pub snapshot_version: Option<u32>,
}

/// Write side of the remote service.
pub trait StorageMutator: Send + Sync {
    /// Re-point one version at the destination storage location.
    fn move_version(&self, request: &MoveRequest) -> Result<MoveOutcome, RemoteError>;

    /// Create a snapshot version of a table.
    fn snapshot_table(&self, table_id: &str) -> Result<SnapshotOutcome, RemoteError>;
}

/// Call `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
///
/// Delays grow exponentially; a larger server-provided `retry_after` wins.
pub fn with_backoff<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Result<T, RemoteError>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = backoff_delay(policy, attempt, &err);
                tracing::warn!(
                    call = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable remote error, backing off"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32, err: &RemoteError) -> Duration {
    let computed = policy.delay_for(attempt);
    match err.retry_after() {
        Some(hint) if hint > computed => hint,
        _ => computed,
    }
}
