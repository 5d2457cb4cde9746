//! Result and status reporting.
//!
//! `MigrationResult` is a read-only view over an index store. Nothing is
//! cached: every call reads the store as it is at that moment, so an
//! operator can watch a migration running in another process.

use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::EngineResult;
use crate::model::{IndexEntry, MigrationStatus, StatusCounts};
use crate::store::{EntryIter, IndexStore};

/// One CSV line.
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    entity_id: &'a str,
    version: Option<u32>,
    entity_type: &'static str,
    from_storage_location_id: Option<&'a str>,
    to_storage_location_id: Option<&'a str>,
    status: &'static str,
    exception_message: Option<&'a str>,
}

impl<'a> From<&'a IndexEntry> for CsvRow<'a> {
    fn from(entry: &'a IndexEntry) -> Self {
        CsvRow {
            entity_id: &entry.entity_id,
            version: entry.version,
            entity_type: entry.entity_type.as_str(),
            from_storage_location_id: entry.from_storage_location_id.as_deref(),
            to_storage_location_id: entry.to_storage_location_id.as_deref(),
            status: entry.status.as_str(),
            exception_message: match entry.status {
                MigrationStatus::Errored => entry.exception_message.as_deref(),
                _ => None,
            },
        }
    }
}

/// Live view of a migration's results.
#[derive(Debug)]
pub struct MigrationResult<'a> {
    store: &'a IndexStore,
    csv_path: Option<PathBuf>,
}

impl<'a> MigrationResult<'a> {
    pub fn new(store: &'a IndexStore, csv_path: Option<PathBuf>) -> Self {
        MigrationResult { store, csv_path }
    }

    pub fn store(&self) -> &IndexStore {
        self.store
    }

    pub fn csv_path(&self) -> Option<&Path> {
        self.csv_path.as_deref()
    }

    /// Current number of entries per status.
    pub fn counts(&self) -> EngineResult<StatusCounts> {
        self.store.counts()
    }

    /// Every counted entry, lazily, in key order. Containers appear only
    /// when their listing failed.
    pub fn entries(&self) -> EntryIter<'a> {
        self.store.entries()
    }

    /// True if any ERRORED rows remain.
    pub fn has_errors(&self) -> EngineResult<bool> {
        Ok(self.counts()?.get(MigrationStatus::Errored) > 0)
    }

    /// Write one row per counted entry to `path`, so the row count always
    /// equals `counts().total()`.
    ///
    /// Returns the number of rows written.
    pub fn export_csv(&self, path: impl AsRef<Path>) -> EngineResult<u64> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        let rows = self.write_rows(file)?;
        tracing::info!(path = %path.display(), rows, "CSV report written");
        Ok(rows)
    }

    /// Export to the configured CSV path, if any.
    pub fn write_csv(&self) -> EngineResult<Option<u64>> {
        match &self.csv_path {
            Some(path) => self.export_csv(path).map(Some),
            None => Ok(None),
        }
    }

    fn write_rows<W: Write>(&self, out: W) -> EngineResult<u64> {
        let mut writer = csv::Writer::from_writer(out);
        let mut rows = 0;
        for entry in self.entries() {
            let entry = entry?;
            writer.serialize(CsvRow::from(&entry))?;
            rows += 1;
        }
        // Header only, so consumers always see the schema
        if rows == 0 {
            writer.write_record([
                "entity_id",
                "version",
                "entity_type",
                "from_storage_location_id",
                "to_storage_location_id",
                "status",
                "exception_message",
            ])?;
        }
        writer.flush()?;
        Ok(rows)
    }
}
