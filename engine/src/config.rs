//! Option records for indexing and migration.
//!
//! Each record deserializes with serde (missing fields take the documented
//! defaults) and is validated eagerly at the start of the operation that
//! consumes it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::model::VersionStrategy;

/// Options for an indexing pass.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IndexOptions {
    /// Project, folder, file or table to walk.
    pub root_id: String,
    /// Storage location every indexed entry is bound for.
    pub destination_location_id: String,
    /// Only index entries currently stored in one of these locations.
    /// `None` indexes every location.
    #[serde(default)]
    pub source_location_ids: Option<BTreeSet<String>>,
    /// Which file versions to index (default: new).
    #[serde(default)]
    pub version_strategy: VersionStrategy,
    /// Index table entities as well as files (default: false).
    #[serde(default)]
    pub include_table_entities: bool,
    /// Record failed lookups as ERRORED rows instead of aborting (default: false).
    #[serde(default)]
    pub continue_on_error: bool,
    /// Maximum remote lookups in flight (default: 4).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Backoff for throttled listing calls.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl IndexOptions {
    /// Options for `root_id` with every other field at its default.
    pub fn new(root_id: impl Into<String>, destination_location_id: impl Into<String>) -> Self {
        IndexOptions {
            root_id: root_id.into(),
            destination_location_id: destination_location_id.into(),
            source_location_ids: None,
            version_strategy: VersionStrategy::default(),
            include_table_entities: false,
            continue_on_error: false,
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.root_id.trim().is_empty() {
            return Err(EngineError::InvalidConfig("root_id must not be empty".to_string()));
        }
        if self.destination_location_id.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "destination_location_id must not be empty".to_string(),
            ));
        }
        if let Some(sources) = &self.source_location_ids {
            if sources.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "source_location_ids, when given, must name at least one location".to_string(),
                ));
            }
        }
        validate_concurrency(self.concurrency)?;
        self.retry.validate()
    }

    /// Returns true if an entry stored at `location` passes the source filter.
    pub fn accepts_source(&self, location: Option<&str>) -> bool {
        match (&self.source_location_ids, location) {
            (None, _) => true,
            (Some(sources), Some(location)) => sources.contains(location),
            (Some(_), None) => false,
        }
    }
}

/// Options for a migration pass.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MigrateOptions {
    /// Snapshot every table that had rows migrated (default: false).
    #[serde(default)]
    pub create_table_snapshots: bool,
    /// Record failed moves as ERRORED rows and keep going (default: false).
    #[serde(default)]
    pub continue_on_error: bool,
    /// Skip the confirmation prompt (default: false).
    #[serde(default)]
    pub force: bool,
    /// Backoff for throttled or contended calls.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        MigrateOptions {
            create_table_snapshots: false,
            continue_on_error: false,
            force: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl MigrateOptions {
    pub fn validate(&self) -> EngineResult<()> {
        self.retry.validate()
    }
}

/// Exponential backoff applied to retryable remote errors.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default: 250).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(EngineError::InvalidConfig(
                "retry.multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(EngineError::InvalidConfig(
                "retry.max_delay_ms must not be smaller than retry.initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

fn validate_concurrency(concurrency: usize) -> EngineResult<()> {
    if concurrency == 0 {
        return Err(EngineError::InvalidConfig(
            "concurrency must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}
