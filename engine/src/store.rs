//! Persistent index store.
//!
//! A single SQLite file holding one row per (entity, version) candidate plus a
//! metadata table that binds the file to one root and one destination storage
//! location. Writes go through one mutex-guarded connection, one IMMEDIATE
//! transaction per call. Reads go through a small pool of read-only
//! connections so reporters can run alongside a writer (WAL mode).

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::model::{EntityType, IndexEntry, MigrationStatus, StatusCounts, StatusUpdate};

/// On-disk value of the "no version" sentinel.
const NO_VERSION: i64 = -1;

/// Rows fetched per page by the lazy iterators.
const PAGE_SIZE: usize = 500;

/// Read connections kept per store handle.
const DEFAULT_READERS: usize = 4;

const SCHEMA_VERSION: &str = "1";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS store_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS index_entries (
    entity_id                TEXT    NOT NULL,
    version                  INTEGER NOT NULL,
    entity_type              TEXT    NOT NULL,
    parent_id                TEXT,
    from_storage_location_id TEXT,
    to_storage_location_id   TEXT,
    file_handle_id           TEXT,
    file_size                INTEGER,
    status                   TEXT    NOT NULL,
    exception_message        TEXT,
    etag                     TEXT,
    indexed_at               TEXT    NOT NULL,
    updated_at               TEXT    NOT NULL,
    PRIMARY KEY (entity_id, version)
);
CREATE INDEX IF NOT EXISTS idx_index_entries_status
    ON index_entries (status, entity_id, version);
";

const ENTRY_COLUMNS: &str = "entity_id, version, entity_type, parent_id, \
    from_storage_location_id, to_storage_location_id, file_handle_id, file_size, \
    status, exception_message, etag";

/// Root and destination a store is permanently bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreBinding {
    pub root_id: String,
    pub destination_location_id: String,
    pub created_at: DateTime<Utc>,
}

/// Handle to an index store file.
pub struct IndexStore {
    path: PathBuf,
    binding: StoreBinding,
    writer: Option<Mutex<Connection>>,
    readers: ReaderPool,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("path", &self.path)
            .field("binding", &self.binding)
            .field("read_only", &self.writer.is_none())
            .finish()
    }
}

impl IndexStore {
    /// Open or create the store at `path` for an indexing pass.
    ///
    /// A new file is bound to `root_id` and `destination_location_id`. An
    /// existing file must already be bound to the same pair.
    ///
    /// # Errors
    /// - `StoreConflict` if the file is bound to a different root or destination
    /// - `StoreCorrupt` if the file is not an index store
    pub fn open_for_indexing(
        path: impl AsRef<Path>,
        root_id: &str,
        destination_location_id: &str,
    ) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(&path).map_err(|e| classify_open_error(&path, e))?;
        configure_writer(&conn).map_err(|e| classify_open_error(&path, e))?;

        let binding = {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| classify_open_error(&path, e))?;
            tx.execute_batch(SCHEMA)
                .map_err(|e| classify_open_error(&path, e))?;

            let binding = match read_binding(&tx, &path)? {
                Some(existing) => {
                    check_binding(&path, &existing, root_id, destination_location_id)?;
                    existing
                }
                None => {
                    let binding = StoreBinding {
                        root_id: root_id.to_string(),
                        destination_location_id: destination_location_id.to_string(),
                        created_at: Utc::now(),
                    };
                    write_binding(&tx, &binding)?;
                    binding
                }
            };
            tx.commit()?;
            binding
        };

        tracing::debug!(
            path = %path.display(),
            root_id = %binding.root_id,
            destination = %binding.destination_location_id,
            "opened index store for indexing"
        );

        let readers = ReaderPool::open(&path, DEFAULT_READERS)?;
        Ok(IndexStore {
            path,
            binding,
            writer: Some(Mutex::new(conn)),
            readers,
        })
    }

    /// Open an already-indexed store for migration.
    ///
    /// # Errors
    /// - `StoreNotFound` if nothing was ever indexed at `path`
    /// - `StoreCorrupt` if the file is not an index store
    pub fn open_existing(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = open_without_create(&path, flags)?;
        configure_writer(&conn).map_err(|e| classify_open_error(&path, e))?;

        let binding = read_binding(&conn, &path)?.ok_or_else(|| EngineError::StoreNotFound {
            path: path.clone(),
        })?;

        let readers = ReaderPool::open(&path, DEFAULT_READERS)?;
        Ok(IndexStore {
            path,
            binding,
            writer: Some(Mutex::new(conn)),
            readers,
        })
    }

    /// Open an existing store without a writer, e.g. for a reporter running
    /// alongside a migration in another process.
    pub fn open_read_only(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_without_create(&path, read_only_flags())?;
        let binding = read_binding(&conn, &path)?.ok_or_else(|| EngineError::StoreNotFound {
            path: path.clone(),
        })?;
        drop(conn);

        let readers = ReaderPool::open(&path, DEFAULT_READERS)?;
        Ok(IndexStore {
            path,
            binding,
            writer: None,
            readers,
        })
    }

    /// Read the binding of the store at `path` without opening it for writing.
    ///
    /// Returns `None` if no store exists there yet.
    pub fn peek_binding(path: impl AsRef<Path>) -> EngineResult<Option<StoreBinding>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let conn = open_without_create(path, read_only_flags())?;
        read_binding(&conn, path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn binding(&self) -> &StoreBinding {
        &self.binding
    }

    pub fn destination_location_id(&self) -> &str {
        &self.binding.destination_location_id
    }

    /// Insert or overwrite one entry in a single transaction.
    ///
    /// The destination column is always taken from the store binding, and is
    /// left empty for containers. The exception message is only kept for
    /// ERRORED rows.
    pub fn upsert(&self, entry: &IndexEntry) -> EngineResult<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        write_entry(&tx, &self.binding, entry)?;
        tx.commit()?;
        Ok(())
    }

    /// Swap a placeholder row (one recorded without a known version) for
    /// its resolved entry, in a single transaction.
    pub fn replace_placeholder(&self, entity_id: &str, entry: &IndexEntry) -> EngineResult<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM index_entries
             WHERE entity_id = ?1 AND version = ?2 AND entity_type <> 'CONTAINER'",
            params![entity_id, NO_VERSION],
        )?;
        write_entry(&tx, &self.binding, entry)?;
        tx.commit()?;
        Ok(())
    }

    /// Fetch one entry by key.
    pub fn get(&self, entity_id: &str, version: Option<u32>) -> EngineResult<Option<IndexEntry>> {
        let sql = format!(
            "SELECT {} FROM index_entries WHERE entity_id = ?1 AND version = ?2",
            ENTRY_COLUMNS
        );
        self.readers.with_reader(|conn| {
            let entry = conn
                .query_row(&sql, params![entity_id, version_to_sql(version)], entry_from_row)
                .optional()?;
            Ok(entry)
        })
    }

    /// Apply an executor status change to one entry in a single transaction.
    ///
    /// The transition is checked against the current on-disk status, so two
    /// runs can never both move the same row.
    ///
    /// # Errors
    /// - `InvalidTransition` if the state machine forbids the change
    /// - `Database(QueryReturnedNoRows)` if the entry does not exist
    pub fn set_status(
        &self,
        entity_id: &str,
        version: Option<u32>,
        new_status: MigrationStatus,
        update: StatusUpdate,
    ) -> EngineResult<IndexEntry> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql_version = version_to_sql(version);

        let current: String = tx.query_row(
            "SELECT status FROM index_entries WHERE entity_id = ?1 AND version = ?2",
            params![entity_id, sql_version],
            |row| row.get(0),
        )?;
        let current: MigrationStatus =
            current.parse().map_err(|reason| EngineError::StoreCorrupt {
                path: self.path.clone(),
                reason,
            })?;

        if !current.can_transition_to(new_status) {
            return Err(EngineError::InvalidTransition {
                entity_id: entity_id.to_string(),
                version,
                from: current,
                to: new_status,
            });
        }

        let exception = match new_status {
            MigrationStatus::Errored => update.exception_message,
            _ => None,
        };

        tx.execute(
            "UPDATE index_entries
             SET status = ?3,
                 exception_message = ?4,
                 file_handle_id = COALESCE(?5, file_handle_id),
                 updated_at = ?6
             WHERE entity_id = ?1 AND version = ?2",
            params![
                entity_id,
                sql_version,
                new_status.as_str(),
                exception,
                update.file_handle_id,
                Utc::now().to_rfc3339(),
            ],
        )?;

        let sql = format!(
            "SELECT {} FROM index_entries WHERE entity_id = ?1 AND version = ?2",
            ENTRY_COLUMNS
        );
        let entry = tx.query_row(&sql, params![entity_id, sql_version], entry_from_row)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Lazily iterate over non-container entries with `status`, ordered by
    /// (entity id, version).
    ///
    /// Pages are fetched on demand by key, so rows updated while iterating
    /// are neither skipped nor repeated.
    pub fn get_by_status(&self, status: MigrationStatus) -> EntryIter<'_> {
        EntryIter::new(self, Some(status))
    }

    /// Lazily iterate over every counted entry in key order: all
    /// non-container rows plus ERRORED containers, matching `counts`.
    pub fn entries(&self) -> EntryIter<'_> {
        EntryIter::new(self, None)
    }

    /// Live number of entries per status.
    ///
    /// Containers are structural and not counted, except containers whose
    /// listing failed (ERRORED), so that failed subtrees stay visible.
    pub fn counts(&self) -> EngineResult<StatusCounts> {
        let rows = self.readers.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM index_entries
                 WHERE entity_type <> 'CONTAINER' OR status = 'ERRORED'
                 GROUP BY status",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let status: MigrationStatus =
                status.parse().map_err(|reason| EngineError::StoreCorrupt {
                    path: self.path.clone(),
                    reason,
                })?;
            counts.set(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Container rows with `status`, in key order.
    ///
    /// Only small sets are expected here (containers whose listing failed), so
    /// the rows are collected eagerly.
    pub fn containers_with_status(&self, status: MigrationStatus) -> EngineResult<Vec<IndexEntry>> {
        let sql = format!(
            "SELECT {} FROM index_entries
             WHERE entity_type = 'CONTAINER' AND status = ?1
             ORDER BY entity_id, version",
            ENTRY_COLUMNS
        );
        self.readers.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![status.as_str()], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn writer(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        let writer = self.writer.as_ref().ok_or_else(|| EngineError::StoreReadOnly {
            path: self.path.clone(),
        })?;
        // Poisoning is harmless here: an unfinished transaction rolls back on drop.
        Ok(writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn fetch_page(
        &self,
        status: Option<MigrationStatus>,
        after: &(String, i64),
    ) -> EngineResult<Vec<IndexEntry>> {
        let filter = match status {
            Some(_) => "entity_type <> 'CONTAINER' AND status = ?4",
            None => "(entity_type <> 'CONTAINER' OR status = 'ERRORED')",
        };
        let sql = format!(
            "SELECT {} FROM index_entries
             WHERE {}
               AND (entity_id, version) > (?1, ?2)
             ORDER BY entity_id, version
             LIMIT ?3",
            ENTRY_COLUMNS, filter
        );
        self.readers.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = match status {
                Some(status) => stmt
                    .query_map(
                        params![after.0, after.1, PAGE_SIZE as i64, status.as_str()],
                        entry_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?,
                None => stmt
                    .query_map(params![after.0, after.1, PAGE_SIZE as i64], entry_from_row)?
                    .collect::<Result<Vec<_>, _>>()?,
            };
            Ok(rows)
        })
    }
}

/// Lazy, paged iterator over index entries.
pub struct EntryIter<'a> {
    store: &'a IndexStore,
    status: Option<MigrationStatus>,
    after: (String, i64),
    buffer: VecDeque<IndexEntry>,
    exhausted: bool,
}

impl<'a> EntryIter<'a> {
    fn new(store: &'a IndexStore, status: Option<MigrationStatus>) -> Self {
        EntryIter {
            store,
            status,
            // Sorts before every real key
            after: (String::new(), NO_VERSION - 1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

impl Iterator for EntryIter<'_> {
    type Item = EngineResult<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.fetch_page(self.status, &self.after) {
                Ok(page) => {
                    if page.len() < PAGE_SIZE {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.after = (last.entity_id.clone(), version_to_sql(last.version));
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

fn write_entry(conn: &Connection, binding: &StoreBinding, entry: &IndexEntry) -> EngineResult<()> {
    let to_location = match entry.entity_type {
        EntityType::Container => None,
        _ => Some(binding.destination_location_id.as_str()),
    };
    let exception = match entry.status {
        MigrationStatus::Errored => entry.exception_message.as_deref(),
        _ => None,
    };
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO index_entries (
            entity_id, version, entity_type, parent_id, from_storage_location_id,
            to_storage_location_id, file_handle_id, file_size, status,
            exception_message, etag, indexed_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
        ON CONFLICT (entity_id, version) DO UPDATE SET
            entity_type = excluded.entity_type,
            parent_id = excluded.parent_id,
            from_storage_location_id = excluded.from_storage_location_id,
            to_storage_location_id = excluded.to_storage_location_id,
            file_handle_id = excluded.file_handle_id,
            file_size = excluded.file_size,
            status = excluded.status,
            exception_message = excluded.exception_message,
            etag = excluded.etag,
            indexed_at = excluded.indexed_at,
            updated_at = excluded.updated_at",
        params![
            entry.entity_id,
            version_to_sql(entry.version),
            entry.entity_type.as_str(),
            entry.parent_id,
            entry.from_storage_location_id,
            to_location,
            entry.file_handle_id,
            entry.file_size.map(|size| size as i64),
            entry.status.as_str(),
            exception,
            entry.etag,
            now,
        ],
    )?;
    Ok(())
}

/// Fixed set of read-only connections handed out one at a time.
struct ReaderPool {
    sender: Sender<Connection>,
    receiver: Receiver<Connection>,
}

impl ReaderPool {
    fn open(path: &Path, size: usize) -> EngineResult<Self> {
        let (sender, receiver) = bounded(size);
        for _ in 0..size {
            let conn = open_without_create(path, read_only_flags())?;
            conn.busy_timeout(Duration::from_secs(5))?;
            // Capacity equals `size`, so this never blocks or fails.
            let _ = sender.try_send(conn);
        }
        Ok(ReaderPool { sender, receiver })
    }

    /// Run `f` on a pooled connection, waiting if all are in use.
    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> EngineResult<T>) -> EngineResult<T> {
        let conn = self.receiver.recv().map_err(|_| {
            EngineError::Io(std::io::Error::other("index store reader pool is closed"))
        })?;
        let result = f(&conn);
        let _ = self.sender.try_send(conn);
        result
    }
}

fn read_only_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
}

fn open_without_create(path: &Path, flags: OpenFlags) -> EngineResult<Connection> {
    if !path.exists() {
        return Err(EngineError::StoreNotFound {
            path: path.to_path_buf(),
        });
    }
    Connection::open_with_flags(path, flags).map_err(|e| classify_open_error(path, e))
}

fn configure_writer(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Map "this is not a database" failures onto `StoreCorrupt`.
fn classify_open_error(path: &Path, err: rusqlite::Error) -> EngineError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::NotADatabase) | Some(rusqlite::ErrorCode::DatabaseCorrupt) => {
            EngineError::StoreCorrupt {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }
        }
        _ => EngineError::Database(err),
    }
}

fn read_binding(conn: &Connection, path: &Path) -> EngineResult<Option<StoreBinding>> {
    let has_metadata: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'store_metadata')",
            [],
            |row| row.get(0),
        )
        .map_err(|e| classify_open_error(path, e))?;
    if !has_metadata {
        return Ok(None);
    }

    let mut stmt = conn.prepare("SELECT key, value FROM store_metadata")?;
    let pairs = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    if pairs.is_empty() {
        return Ok(None);
    }

    let lookup = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| EngineError::StoreCorrupt {
                path: path.to_path_buf(),
                reason: format!("metadata key '{}' is missing", key),
            })
    };

    let schema_version = lookup("schema_version")?;
    if schema_version != SCHEMA_VERSION {
        return Err(EngineError::StoreCorrupt {
            path: path.to_path_buf(),
            reason: format!("unsupported schema version '{}'", schema_version),
        });
    }

    let created_at = DateTime::parse_from_rfc3339(&lookup("created_at")?)
        .map_err(|e| EngineError::StoreCorrupt {
            path: path.to_path_buf(),
            reason: format!("invalid created_at: {}", e),
        })?
        .with_timezone(&Utc);

    Ok(Some(StoreBinding {
        root_id: lookup("root_id")?,
        destination_location_id: lookup("destination_location_id")?,
        created_at,
    }))
}

fn write_binding(conn: &Connection, binding: &StoreBinding) -> EngineResult<()> {
    let created_at = binding.created_at.to_rfc3339();
    let pairs = [
        ("schema_version", SCHEMA_VERSION),
        ("root_id", binding.root_id.as_str()),
        ("destination_location_id", binding.destination_location_id.as_str()),
        ("created_at", created_at.as_str()),
    ];
    for (key, value) in pairs {
        conn.execute(
            "INSERT INTO store_metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
    }
    Ok(())
}

/// Fail with `StoreConflict` unless `existing` matches the requested pair.
pub(crate) fn check_binding(
    path: &Path,
    existing: &StoreBinding,
    root_id: &str,
    destination_location_id: &str,
) -> EngineResult<()> {
    if existing.destination_location_id != destination_location_id {
        return Err(EngineError::StoreConflict {
            path: path.to_path_buf(),
            field: "destination_location_id",
            recorded: existing.destination_location_id.clone(),
            requested: destination_location_id.to_string(),
        });
    }
    if existing.root_id != root_id {
        return Err(EngineError::StoreConflict {
            path: path.to_path_buf(),
            field: "root_id",
            recorded: existing.root_id.clone(),
            requested: root_id.to_string(),
        });
    }
    Ok(())
}

fn version_to_sql(version: Option<u32>) -> i64 {
    version.map(i64::from).unwrap_or(NO_VERSION)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<IndexEntry> {
    let version: i64 = row.get(1)?;
    let entity_type: String = row.get(2)?;
    let file_size: Option<i64> = row.get(7)?;
    let status: String = row.get(8)?;

    Ok(IndexEntry {
        entity_id: row.get(0)?,
        version: u32::try_from(version).ok(),
        entity_type: entity_type.parse().map_err(|e: String| conversion_error(2, e))?,
        parent_id: row.get(3)?,
        from_storage_location_id: row.get(4)?,
        to_storage_location_id: row.get(5)?,
        file_handle_id: row.get(6)?,
        file_size: file_size.and_then(|size| u64::try_from(size).ok()),
        status: status.parse().map_err(|e: String| conversion_error(8, e))?,
        exception_message: row.get(9)?,
        etag: row.get(10)?,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}
