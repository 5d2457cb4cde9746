use relocate_engine::{
    ChildPage, EntityHeader, EntityLister, MoveOutcome, MoveRequest, RemoteError, RemoteKind,
    SnapshotOutcome, StorageMutator, VersionInfo, VersionPage,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A storage move the fake accepted or rejected, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveCall {
    pub entity_id: String,
    pub version: u32,
}

#[derive(Debug, Clone)]
struct FakeEntity {
    header: EntityHeader,
    children: Vec<String>,
    versions: BTreeMap<u32, VersionInfo>,
}

#[derive(Default)]
struct FakeState {
    entities: HashMap<String, FakeEntity>,
    failing_lookups: HashSet<(String, u32)>,
    denied_listings: HashSet<String>,
    failing_moves: HashMap<(String, u32), RemoteError>,
    throttled_moves: HashMap<(String, u32), u32>,
    moves: Vec<MoveCall>,
    snapshots: Vec<String>,
}

/// In-memory remote service implementing both collaborator traits.
///
/// Listings are served `page_size` items at a time. Faults can be injected
/// per entity version, and every mutation is logged in call order.
#[allow(dead_code)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    page_size: usize,
    lister_calls: AtomicUsize,
}

#[allow(dead_code)]
impl FakeRemote {
    pub fn new() -> Self {
        FakeRemote {
            state: Mutex::new(FakeState::default()),
            page_size: 2,
            lister_calls: AtomicUsize::new(0),
        }
    }

    pub fn add_project(&self, id: &str) {
        self.insert(None, id, RemoteKind::Project, BTreeMap::new());
    }

    pub fn add_folder(&self, parent: &str, id: &str) {
        self.insert(Some(parent), id, RemoteKind::Folder, BTreeMap::new());
    }

    /// Add a file whose versions live at the given storage locations. The
    /// highest version is the current one.
    pub fn add_file(&self, parent: &str, id: &str, versions: &[(u32, &str)]) {
        self.insert(Some(parent), id, RemoteKind::File, version_map(id, versions));
    }

    pub fn add_table(&self, parent: &str, id: &str, versions: &[(u32, &str)]) {
        self.insert(Some(parent), id, RemoteKind::Table, version_map(id, versions));
    }

    pub fn add_link(&self, parent: &str, id: &str) {
        self.insert(Some(parent), id, RemoteKind::Other, BTreeMap::new());
    }

    pub fn fail_lookup(&self, id: &str, version: u32) {
        self.state().failing_lookups.insert((id.to_string(), version));
    }

    pub fn heal_lookup(&self, id: &str, version: u32) {
        self.state().failing_lookups.remove(&(id.to_string(), version));
    }

    pub fn deny_listing(&self, container: &str) {
        self.state().denied_listings.insert(container.to_string());
    }

    pub fn allow_listing(&self, container: &str) {
        self.state().denied_listings.remove(container);
    }

    pub fn fail_move(&self, id: &str, version: u32, error: RemoteError) {
        self.state().failing_moves.insert((id.to_string(), version), error);
    }

    /// Throttle the next `times` moves of a version before accepting it.
    pub fn throttle_move(&self, id: &str, version: u32, times: u32) {
        self.state().throttled_moves.insert((id.to_string(), version), times);
    }

    /// Change the etag of a version behind the index's back.
    pub fn touch(&self, id: &str, version: u32) {
        let mut state = self.state();
        if let Some(info) = state
            .entities
            .get_mut(id)
            .and_then(|entity| entity.versions.get_mut(&version))
        {
            info.etag = Some(format!("etag-{}-{}-touched", id, version));
        }
    }

    /// Every move attempted, in order, including throttled retries.
    pub fn moves(&self) -> Vec<MoveCall> {
        self.state().moves.clone()
    }

    pub fn snapshots(&self) -> Vec<String> {
        self.state().snapshots.clone()
    }

    pub fn location_of(&self, id: &str, version: u32) -> Option<String> {
        self.state()
            .entities
            .get(id)
            .and_then(|entity| entity.versions.get(&version))
            .and_then(|info| info.storage_location_id.clone())
    }

    /// Number of read calls served so far.
    pub fn lister_calls(&self) -> usize {
        self.lister_calls.load(Ordering::SeqCst)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn insert(
        &self,
        parent: Option<&str>,
        id: &str,
        kind: RemoteKind,
        versions: BTreeMap<u32, VersionInfo>,
    ) {
        let mut state = self.state();
        let entity = FakeEntity {
            header: EntityHeader {
                id: id.to_string(),
                name: format!("{}-name", id),
                kind,
                current_version: versions.keys().max().copied(),
            },
            children: Vec::new(),
            versions,
        };
        state.entities.insert(id.to_string(), entity);
        if let Some(parent) = parent {
            state
                .entities
                .get_mut(parent)
                .expect("Parent must be added first")
                .children
                .push(id.to_string());
        }
    }

    fn page<T: Clone>(&self, items: &[T], page_token: Option<&str>) -> (Vec<T>, Option<String>) {
        let start: usize = page_token.map(|t| t.parse().expect("Invalid page token")).unwrap_or(0);
        let end = (start + self.page_size).min(items.len());
        let next = if end < items.len() { Some(end.to_string()) } else { None };
        (items[start..end].to_vec(), next)
    }
}

fn version_map(id: &str, versions: &[(u32, &str)]) -> BTreeMap<u32, VersionInfo> {
    versions
        .iter()
        .map(|(version, location)| {
            (
                *version,
                VersionInfo {
                    file_handle_id: Some(format!("fh-{}-{}", id, version)),
                    storage_location_id: Some(location.to_string()),
                    etag: Some(format!("etag-{}-{}", id, version)),
                    file_size: Some(100),
                },
            )
        })
        .collect()
}

impl EntityLister for FakeRemote {
    fn get_entity(&self, entity_id: &str) -> Result<EntityHeader, RemoteError> {
        self.lister_calls.fetch_add(1, Ordering::SeqCst);
        self.state()
            .entities
            .get(entity_id)
            .map(|entity| entity.header.clone())
            .ok_or_else(|| RemoteError::NotFound(entity_id.to_string()))
    }

    fn list_children(
        &self,
        container_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, RemoteError> {
        self.lister_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.denied_listings.contains(container_id) {
            return Err(RemoteError::PermissionDenied(container_id.to_string()));
        }
        let entity = state
            .entities
            .get(container_id)
            .ok_or_else(|| RemoteError::NotFound(container_id.to_string()))?;
        let headers: Vec<EntityHeader> = entity
            .children
            .iter()
            .filter_map(|child| state.entities.get(child).map(|e| e.header.clone()))
            .collect();
        let (children, next_page_token) = self.page(&headers, page_token);
        Ok(ChildPage { children, next_page_token })
    }

    fn list_versions(
        &self,
        entity_id: &str,
        page_token: Option<&str>,
    ) -> Result<VersionPage, RemoteError> {
        self.lister_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        let entity = state
            .entities
            .get(entity_id)
            .ok_or_else(|| RemoteError::NotFound(entity_id.to_string()))?;
        // Newest first, like the real service
        let numbers: Vec<u32> = entity.versions.keys().rev().copied().collect();
        let (versions, next_page_token) = self.page(&numbers, page_token);
        Ok(VersionPage { versions, next_page_token })
    }

    fn get_version(&self, entity_id: &str, version: u32) -> Result<VersionInfo, RemoteError> {
        self.lister_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.failing_lookups.contains(&(entity_id.to_string(), version)) {
            return Err(RemoteError::Timeout(format!("{}.{}", entity_id, version)));
        }
        state
            .entities
            .get(entity_id)
            .and_then(|entity| entity.versions.get(&version))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("{}.{}", entity_id, version)))
    }
}

impl StorageMutator for FakeRemote {
    fn move_version(&self, request: &MoveRequest) -> Result<MoveOutcome, RemoteError> {
        let mut state = self.state();
        state.moves.push(MoveCall {
            entity_id: request.entity_id.clone(),
            version: request.version,
        });

        let key = (request.entity_id.clone(), request.version);
        if let Some(error) = state.failing_moves.get(&key) {
            return Err(error.clone());
        }
        if let Some(remaining) = state.throttled_moves.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Throttled { retry_after: None });
            }
        }

        let info = state
            .entities
            .get_mut(&request.entity_id)
            .and_then(|entity| entity.versions.get_mut(&request.version))
            .ok_or_else(|| RemoteError::NotFound(request.entity_id.clone()))?;
        if info.etag != request.etag {
            return Err(RemoteError::StaleEtag(format!(
                "{}.{}",
                request.entity_id, request.version
            )));
        }

        let new_handle = format!("fh-{}-{}-moved", request.entity_id, request.version);
        info.storage_location_id = Some(request.destination_location_id.clone());
        info.file_handle_id = Some(new_handle.clone());
        info.etag = Some(format!("etag-{}-{}-moved", request.entity_id, request.version));
        Ok(MoveOutcome { file_handle_id: Some(new_handle) })
    }

    fn snapshot_table(&self, table_id: &str) -> Result<SnapshotOutcome, RemoteError> {
        let mut state = self.state();
        state.snapshots.push(table_id.to_string());
        let next = state
            .entities
            .get(table_id)
            .and_then(|entity| entity.header.current_version)
            .map(|v| v + 1);
        Ok(SnapshotOutcome { snapshot_version: next })
    }
}
