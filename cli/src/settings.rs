//! Optional TOML settings file.
//!
//! Every value is optional; command-line flags win over the file, and the
//! file wins over the engine defaults.

use anyhow::{Context, Result};
use relocate_engine::{RetryPolicy, VersionStrategy};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub index: IndexSettings,
    #[serde(default)]
    pub migrate: MigrateSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RemoteSettings {
    /// Base URL of the REST service
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            base_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IndexSettings {
    pub source_location_ids: Option<Vec<String>>,
    pub version_strategy: Option<VersionStrategy>,
    pub include_table_entities: Option<bool>,
    pub continue_on_error: Option<bool>,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MigrateSettings {
    pub create_table_snapshots: Option<bool>,
    pub continue_on_error: Option<bool>,
    pub retry: Option<RetryPolicy>,
}

fn default_timeout_secs() -> u64 {
    60
}

impl Settings {
    /// Load settings from `path`, or return the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Settings::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("invalid settings file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_gives_defaults() {
        let settings = Settings::load(None).expect("Failed to load defaults");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.remote.timeout_secs, 60);
    }

    #[test]
    fn test_load_sections() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("relocate.toml");
        std::fs::write(
            &path,
            r#"
            [remote]
            base_url = "https://repo.example.org/api/v1/"

            [index]
            version_strategy = "all"
            source_location_ids = ["1", "7"]
            concurrency = 8

            [migrate]
            create_table_snapshots = true

            [migrate.retry]
            max_attempts = 3
            "#,
        )
        .expect("Failed to write settings");

        let settings = Settings::load(Some(&path)).expect("Failed to load settings");
        assert_eq!(settings.remote.base_url.as_deref(), Some("https://repo.example.org/api/v1/"));
        assert_eq!(settings.remote.timeout_secs, 60);
        assert_eq!(settings.index.version_strategy, Some(VersionStrategy::All));
        assert_eq!(settings.index.concurrency, Some(8));
        assert_eq!(settings.migrate.create_table_snapshots, Some(true));

        let retry = settings.migrate.retry.expect("Expected retry section");
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay_ms, 250);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("relocate.toml");
        std::fs::write(&path, "[index]\nconcurency = 2\n").expect("Failed to write settings");

        assert!(Settings::load(Some(&path)).is_err());
    }
}
