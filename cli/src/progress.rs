//! Terminal progress display.

use indicatif::{ProgressBar, ProgressStyle};
use relocate_engine::{IndexEntry, IndexingSummary, MigrationSummary, ProgressCallback};
use std::sync::Mutex;
use std::time::Duration;

/// Draws a spinner while indexing and a bar while migrating, on stderr.
///
/// With `verbose` set each entry is also logged, since the bar only shows
/// the latest one.
pub struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl BarProgress {
    pub fn new(verbose: bool) -> Self {
        BarProgress { bar: Mutex::new(None), verbose }
    }

    fn replace(&self, bar: Option<ProgressBar>) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(old) = slot.take() {
                old.finish_and_clear();
            }
            *slot = bar;
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                f(bar);
            }
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {pos} indexed  {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta})  {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ")
}

fn format_duration(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

fn describe(entry: &IndexEntry) -> String {
    match entry.version {
        Some(v) => format!("{}.{}", entry.entity_id, v),
        None => entry.entity_id.clone(),
    }
}

impl ProgressCallback for BarProgress {
    fn on_index_started(&self, root_id: &str, destination_location_id: &str) {
        eprintln!("Indexing {} for storage location {}", root_id, destination_location_id);
        let bar = ProgressBar::new_spinner().with_style(spinner_style());
        bar.enable_steady_tick(Duration::from_millis(120));
        self.replace(Some(bar));
    }

    fn on_entry_indexed(&self, entry: &IndexEntry) {
        if self.verbose {
            tracing::info!(entry = %describe(entry), status = %entry.status, "indexed");
        }
        self.with_bar(|bar| {
            bar.inc(1);
            bar.set_message(describe(entry));
        });
    }

    fn on_index_completed(&self, summary: &IndexingSummary) {
        self.replace(None);
        let verb = if summary.cancelled { "Indexing cancelled" } else { "Indexing complete" };
        eprintln!(
            "{}: {} written, {} filtered out, {} errors ({})",
            verb,
            summary.written,
            summary.skipped_by_filter,
            summary.errors,
            format_duration(summary.finished_at - summary.started_at)
        );
    }

    fn on_migration_started(&self, pending: u64) {
        eprintln!("Migrating {} entries", pending);
        self.replace(Some(ProgressBar::new(pending).with_style(bar_style())));
    }

    fn on_entry_migrated(&self, entry: &IndexEntry) {
        if self.verbose {
            tracing::info!(entry = %describe(entry), status = %entry.status, "migrated");
        }
        self.with_bar(|bar| {
            bar.inc(1);
            bar.set_message(describe(entry));
        });
    }

    fn on_migration_completed(&self, summary: &MigrationSummary) {
        self.replace(None);
        let verb = if summary.cancelled { "Migration cancelled" } else { "Migration complete" };
        eprintln!(
            "{}: {} migrated, {} errored, {} table snapshots ({})",
            verb,
            summary.migrated,
            summary.errored,
            summary.snapshots,
            format_duration(summary.finished_at - summary.started_at)
        );
        for failure in &summary.snapshot_failures {
            eprintln!("  snapshot of {} failed: {}", failure.table_id, failure.error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relocate_engine::{EntityType, MigrationStatus};

    #[test]
    fn test_describe_entry() {
        let mut entry = IndexEntry::container("syn1", None);
        assert_eq!(describe(&entry), "syn1");

        entry.entity_type = EntityType::File;
        entry.version = Some(3);
        entry.status = MigrationStatus::Indexed;
        assert_eq!(describe(&entry), "syn1.3");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_duration(chrono::Duration::seconds(125)), "2m 5s");
        assert_eq!(format_duration(chrono::Duration::seconds(3723)), "1h 2m 3s");
    }

    #[test]
    fn test_bar_counts_migrated_entries() {
        let progress = BarProgress::new(false);
        progress.on_migration_started(2);

        let mut entry = IndexEntry::container("syn1", None);
        entry.version = Some(1);
        progress.on_entry_migrated(&entry);

        let position = progress
            .bar
            .lock()
            .expect("Failed to lock bar")
            .as_ref()
            .map(|bar| bar.position());
        assert_eq!(position, Some(1));
    }
}
