//! relocate - Command-line interface for the storage location migration engine.
//!
//! Indexes a project or folder into a local index file, asks for
//! confirmation, migrates the indexed versions and writes a CSV report.

mod http;
mod progress;
mod settings;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use relocate_engine::{
    index_files, migrate_indexed, reindex_errored, CancelFlag, Confirm, EngineError, IndexOptions,
    IndexStore, MigrateOptions, MigrationPreview, MigrationResult, RunContext, StatusCounts,
    VersionStrategy,
};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::http::HttpRemote;
use crate::progress::BarProgress;
use crate::settings::Settings;

/// relocate - Move stored files to a new storage location without re-uploading
#[derive(Parser, Debug)]
#[command(name = "relocate")]
#[command(version)]
#[command(about = "Index and migrate entity versions to a new storage location")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML settings file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Base URL of the REST service (overrides [remote] base_url)
    #[arg(long, global = true, value_name = "URL", env = "RELOCATE_SERVER")]
    server: Option<String>,

    /// Access token
    #[arg(long, global = true, env = "RELOCATE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index a hierarchy and migrate it to the destination storage location
    Migrate(MigrateArgs),
    /// Report the state of an existing index file
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// Project, folder, file or table to migrate
    #[arg(long, value_name = "ID")]
    root: String,

    /// Destination storage location
    #[arg(long, value_name = "ID")]
    destination: String,

    /// Index file; reuse it to resume an interrupted run
    #[arg(long, value_name = "PATH")]
    index: PathBuf,

    /// Only migrate versions currently stored here (repeatable)
    #[arg(long = "source-location", value_name = "ID")]
    source_locations: Vec<String>,

    /// Which versions to migrate: new, all, or existing
    #[arg(long, value_name = "STRATEGY")]
    version_strategy: Option<VersionStrategy>,

    /// Migrate table entities as well as files
    #[arg(long)]
    include_tables: bool,

    /// Snapshot every table that had versions migrated
    #[arg(long)]
    table_snapshots: bool,

    /// Record failures in the index and keep going
    #[arg(long)]
    continue_on_error: bool,

    /// Index only; do not migrate
    #[arg(long)]
    dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    force: bool,

    /// Write a CSV report here when done
    #[arg(long, value_name = "PATH")]
    csv: Option<PathBuf>,

    /// Maximum version lookups in flight while indexing
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Look up ERRORED rows again instead of walking the whole hierarchy
    #[arg(long)]
    retry_errored: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Index file to report on
    #[arg(long, value_name = "PATH")]
    index: PathBuf,

    /// Write a CSV report here
    #[arg(long, value_name = "PATH")]
    csv: Option<PathBuf>,
}

/// How a completed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Everything requested was done
    Clean,
    /// ERRORED rows remain, the run was cancelled, or a snapshot failed
    Incomplete,
}

/// Asks on the terminal before any storage is touched.
struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, preview: &MigrationPreview) -> bool {
        eprintln!("Index: {}", preview.counts);
        let answer = dialoguer::Confirm::new()
            .with_prompt(format!(
                "Migrate {} entries to storage location {}?",
                preview.pending, preview.destination_location_id
            ))
            .default(false)
            .interact();
        prompt_answer(answer)
    }
}

/// A prompt that could not be shown or read counts as a decline.
fn prompt_answer(answer: dialoguer::Result<bool>) -> bool {
    match answer {
        Ok(confirmed) => confirmed,
        Err(err) => {
            tracing::warn!(error = %err, "confirmation prompt failed, treating as declined");
            false
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run_cli(&cli);
    if let Err(err) = &result {
        eprintln!("Error: {:#}", err);
    }
    std::process::exit(exit_code(&result));
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn exit_code(result: &Result<Outcome>) -> i32 {
    match result {
        Ok(Outcome::Clean) => 0,
        Ok(Outcome::Incomplete) => 1,
        Err(_) => 2,
    }
}

/// Main CLI logic - separated for testability
fn run_cli(cli: &Cli) -> Result<Outcome> {
    let settings = Settings::load(cli.config.as_deref())?;
    match &cli.command {
        Command::Migrate(args) => run_migrate(cli, args, &settings),
        Command::Status(args) => run_status(args),
    }
}

fn run_migrate(cli: &Cli, args: &MigrateArgs, settings: &Settings) -> Result<Outcome> {
    let index_options = index_options(args, settings);
    let migrate_options = migrate_options(args, settings);
    // Fail on bad options before touching the network
    index_options.validate()?;
    migrate_options.validate()?;

    let remote = connect(cli, settings)?;
    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("Cancelling after the current batch...");
        handler_flag.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    let progress = BarProgress::new(cli.verbose);
    let ctx = RunContext { progress: Some(&progress), cancel };

    let indexing = if args.retry_errored {
        let store = IndexStore::open_existing(&args.index)?;
        reindex_errored(&remote, &store, &index_options, &ctx)?
    } else {
        index_files(&remote, &args.index, &index_options, &ctx)?
    };
    if indexing.cancelled {
        eprintln!("Indexing cancelled; rerun the same command to resume.");
        return Ok(Outcome::Incomplete);
    }

    let store = IndexStore::open_existing(&args.index)?;
    if args.dry_run {
        eprintln!("Dry run: nothing was migrated.");
        return report(&store, args.csv.as_deref());
    }

    let terminal = TerminalConfirm;
    let confirm: Option<&dyn Confirm> = if std::io::stdin().is_terminal() {
        Some(&terminal)
    } else {
        None
    };
    let summary = match migrate_indexed(&remote, &store, &migrate_options, confirm, &ctx) {
        Ok(summary) => summary,
        Err(err @ EngineError::ConfirmationRequired { .. }) => {
            return Err(err).context("pass --force to migrate without a terminal");
        }
        Err(err) => return Err(err.into()),
    };

    let outcome = report(&store, args.csv.as_deref())?;
    if summary.cancelled {
        eprintln!("Migration cancelled; rerun the same command to resume.");
        return Ok(Outcome::Incomplete);
    }
    if !summary.snapshot_failures.is_empty() {
        return Ok(Outcome::Incomplete);
    }
    Ok(outcome)
}

fn run_status(args: &StatusArgs) -> Result<Outcome> {
    let store = IndexStore::open_read_only(&args.index)?;
    let binding = store.binding();
    println!("Root: {}", binding.root_id);
    println!("Destination: {}", binding.destination_location_id);
    report(&store, args.csv.as_deref())
}

/// Print the counts, write the CSV if asked, and derive the outcome.
fn report(store: &IndexStore, csv: Option<&Path>) -> Result<Outcome> {
    let result = MigrationResult::new(store, csv.map(Path::to_path_buf));
    let counts = result.counts()?;
    print_counts(&counts);

    if let Some(rows) = result.write_csv()? {
        if let Some(path) = result.csv_path() {
            eprintln!("Wrote {} rows to {}", rows, path.display());
        }
    }
    if result.has_errors()? {
        Ok(Outcome::Incomplete)
    } else {
        Ok(Outcome::Clean)
    }
}

fn print_counts(counts: &StatusCounts) {
    for (status, count) in counts.iter() {
        println!("{:<18} {}", status.as_str(), count);
    }
    println!("{:<18} {}", "TOTAL", counts.total());
}

fn connect(cli: &Cli, settings: &Settings) -> Result<HttpRemote> {
    let Some(base_url) = cli.server.as_deref().or(settings.remote.base_url.as_deref()) else {
        bail!("no server configured; pass --server or set [remote] base_url");
    };
    HttpRemote::new(
        base_url,
        cli.token.clone(),
        Duration::from_secs(settings.remote.timeout_secs),
    )
}

/// Merge flags over the settings file over the engine defaults.
fn index_options(args: &MigrateArgs, settings: &Settings) -> IndexOptions {
    let file = &settings.index;
    let mut options = IndexOptions::new(args.root.clone(), args.destination.clone());

    let sources = if args.source_locations.is_empty() {
        file.source_location_ids.clone()
    } else {
        Some(args.source_locations.clone())
    };
    options.source_location_ids = sources.map(|ids| ids.into_iter().collect());

    if let Some(strategy) = args.version_strategy.or(file.version_strategy) {
        options.version_strategy = strategy;
    }
    options.include_table_entities =
        args.include_tables || file.include_table_entities.unwrap_or(false);
    options.continue_on_error = args.continue_on_error || file.continue_on_error.unwrap_or(false);
    if let Some(concurrency) = args.concurrency.or(file.concurrency) {
        options.concurrency = concurrency;
    }
    if let Some(retry) = &settings.migrate.retry {
        options.retry = retry.clone();
    }
    options
}

fn migrate_options(args: &MigrateArgs, settings: &Settings) -> MigrateOptions {
    let file = &settings.migrate;
    let mut options = MigrateOptions {
        create_table_snapshots: args.table_snapshots || file.create_table_snapshots.unwrap_or(false),
        continue_on_error: args.continue_on_error || file.continue_on_error.unwrap_or(false),
        force: args.force,
        ..MigrateOptions::default()
    };
    if let Some(retry) = &file.retry {
        options.retry = retry.clone();
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use relocate_engine::{IndexEntry, MigrationStatus, RetryPolicy};
    use std::collections::BTreeSet;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("Failed to parse arguments")
    }

    fn migrate_args(cli: &Cli) -> &MigrateArgs {
        match &cli.command {
            Command::Migrate(args) => args,
            other => panic!("Expected migrate, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_migrate_flags_translate_to_options() {
        let cli = parse(&[
            "relocate",
            "migrate",
            "--root",
            "syn123",
            "--destination",
            "9001",
            "--index",
            "index.db",
            "--source-location",
            "1",
            "--source-location",
            "7",
            "--version-strategy",
            "all",
            "--include-tables",
            "--table-snapshots",
            "--concurrency",
            "8",
        ]);
        let args = migrate_args(&cli);
        let settings = Settings::default();

        let index = index_options(args, &settings);
        assert_eq!(index.root_id, "syn123");
        assert_eq!(index.destination_location_id, "9001");
        assert_eq!(
            index.source_location_ids,
            Some(BTreeSet::from(["1".to_string(), "7".to_string()]))
        );
        assert_eq!(index.version_strategy, VersionStrategy::All);
        assert!(index.include_table_entities);
        assert!(!index.continue_on_error);
        assert_eq!(index.concurrency, 8);

        let migrate = migrate_options(args, &settings);
        assert!(migrate.create_table_snapshots);
        assert!(!migrate.force);
    }

    #[test]
    fn test_flags_override_settings_file() {
        let cli = parse(&[
            "relocate",
            "migrate",
            "--root",
            "syn1",
            "--destination",
            "2",
            "--index",
            "i.db",
            "--concurrency",
            "2",
        ]);
        let args = migrate_args(&cli);
        let mut settings = Settings::default();
        settings.index.version_strategy = Some(VersionStrategy::Existing);
        settings.index.source_location_ids = Some(vec!["5".to_string()]);
        settings.index.concurrency = Some(16);
        settings.migrate.continue_on_error = Some(true);
        settings.migrate.retry = Some(RetryPolicy { max_attempts: 2, ..RetryPolicy::default() });

        let index = index_options(args, &settings);
        assert_eq!(index.version_strategy, VersionStrategy::Existing);
        assert_eq!(index.source_location_ids, Some(BTreeSet::from(["5".to_string()])));
        assert_eq!(index.concurrency, 2);
        assert_eq!(index.retry.max_attempts, 2);

        let migrate = migrate_options(args, &settings);
        assert!(migrate.continue_on_error);
        assert_eq!(migrate.retry.max_attempts, 2);
    }

    #[test]
    fn test_invalid_version_strategy_is_rejected() {
        let result = Cli::try_parse_from([
            "relocate",
            "migrate",
            "--root",
            "syn1",
            "--destination",
            "2",
            "--index",
            "i.db",
            "--version-strategy",
            "latest",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_concurrency_fails_before_connecting() {
        let cli = parse(&[
            "relocate",
            "migrate",
            "--root",
            "syn1",
            "--destination",
            "2",
            "--index",
            "i.db",
            "--concurrency",
            "0",
        ]);
        let err = run_cli(&cli).expect_err("Expected invalid configuration");
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_prompt_error_counts_as_decline() {
        assert!(prompt_answer(Ok(true)));
        assert!(!prompt_answer(Ok(false)));
        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "terminal closed");
        assert!(!prompt_answer(Err(dialoguer::Error::IO(broken))));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Ok(Outcome::Clean)), 0);
        assert_eq!(exit_code(&Ok(Outcome::Incomplete)), 1);
        assert_eq!(exit_code(&Err(anyhow::anyhow!("boom"))), 2);
    }

    #[test]
    fn test_status_of_missing_index_is_fatal() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let cli = parse(&[
            "relocate",
            "status",
            "--index",
            temp_dir.path().join("missing.db").to_str().expect("Non-UTF-8 temp path"),
        ]);
        let result = run_cli(&cli);
        assert_eq!(exit_code(&result), 2);
    }

    #[test]
    fn test_status_reports_errors_and_writes_csv() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let index_path = temp_dir.path().join("index.db");
        let csv_path = temp_dir.path().join("out/report.csv");
        {
            let store = IndexStore::open_for_indexing(&index_path, "syn1", "9001")
                .expect("Failed to create store");
            let mut entry = IndexEntry::container("syn2", Some("syn1".to_string()));
            entry.entity_type = relocate_engine::EntityType::File;
            entry.version = Some(1);
            entry.status = MigrationStatus::Errored;
            entry.exception_message = Some("permission denied: syn2".to_string());
            store.upsert(&entry).expect("Failed to write entry");
        }

        let cli = parse(&[
            "relocate",
            "status",
            "--index",
            index_path.to_str().expect("Non-UTF-8 temp path"),
            "--csv",
            csv_path.to_str().expect("Non-UTF-8 temp path"),
        ]);
        let result = run_cli(&cli);
        assert_eq!(result.expect("Status failed"), Outcome::Incomplete);

        let csv = std::fs::read_to_string(&csv_path).expect("Failed to read CSV");
        assert!(csv.contains("syn2,1,FILE"));
        assert!(csv.contains("permission denied"));
    }

    #[test]
    fn test_missing_server_is_fatal() {
        let cli = parse(&["relocate", "status", "--index", "i.db"]);
        let settings = Settings::default();
        // RELOCATE_SERVER may be set in the environment running the tests
        if cli.server.is_none() {
            assert!(connect(&cli, &settings).is_err());
        }
    }
}
