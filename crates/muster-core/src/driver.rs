use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::Local;
use tracing::{info, warn};

use crate::config::Config;
use crate::directory::DirectorySync;
use crate::mapping_sync;
use crate::outcome::{self, Disposition};
use crate::reconcile;
use crate::store::MappingStore;

/// Counters for one pass over the event directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub files_discovered: usize,
    pub batches: usize,
    pub upstream_calls: u32,
    pub events: usize,
    pub workers_updated: usize,
    pub workers_failed: usize,
    pub files_succeeded: usize,
    pub files_retried: usize,
    pub files_quarantined: usize,
    pub parse_failures: usize,
    pub mapping_refreshed: bool,
    pub stale_cleared: usize,
}

/// One full pass: refresh mappings if due, drain the event directory in
/// batches, then sweep stale duty-status flags. The stale sweep runs even
/// when there are no files. A mapping refresh error is fatal because a
/// stale table would silently drop workers from every batch.
pub async fn run_once(
    config: &Config,
    store: &MappingStore,
    directory: &dyn DirectorySync,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();

    summary.mapping_refreshed =
        mapping_sync::refresh_if_due(store, directory, config, Local::now().naive_local())
            .await
            .context("worker mapping refresh failed")?;

    let files = discover_event_files(&config.event_dir)?;
    summary.files_discovered = files.len();
    if files.is_empty() {
        info!(dir = %config.event_dir.display(), "no event files waiting");
    }

    for paths in files.chunks(config.batch_size) {
        summary.batches += 1;
        let batch = reconcile::reconcile_batch(store, directory, paths)
            .await
            .context("batch reconciliation failed")?;

        summary.upstream_calls += batch.upstream_calls;
        summary.events += batch.events_total();
        for state in &batch.desired {
            if batch.results.get(&state.username).copied().unwrap_or(false) {
                summary.workers_updated += 1;
            } else {
                summary.workers_failed += 1;
            }
        }

        let outcomes = outcome::settle_batch(store, config, &batch)
            .await
            .context("batch settlement failed")?;
        for file in &outcomes {
            match file.disposition {
                Disposition::Archived | Disposition::LeftInPlace => summary.files_succeeded += 1,
                Disposition::RetryScheduled { .. } => summary.files_retried += 1,
                Disposition::Quarantined => summary.files_quarantined += 1,
                Disposition::ParseFailure => summary.parse_failures += 1,
            }
        }
    }

    summary.stale_cleared = clear_stale_duty_status(directory, config.stale_after_hours).await;

    info!(
        files = summary.files_discovered,
        batches = summary.batches,
        upstream_calls = summary.upstream_calls,
        events = summary.events,
        workers_updated = summary.workers_updated,
        workers_failed = summary.workers_failed,
        succeeded = summary.files_succeeded,
        retried = summary.files_retried,
        quarantined = summary.files_quarantined,
        parse_failures = summary.parse_failures,
        stale_cleared = summary.stale_cleared,
        "run complete"
    );

    Ok(summary)
}

/// List the clock files waiting in the event directory, oldest first by
/// mtime so retried files keep their place in line. Files whose mtime
/// cannot be read sort last; name breaks ties.
pub fn discover_event_files(event_dir: &Path) -> Result<Vec<PathBuf>> {
    if !event_dir.is_dir() {
        bail!("event directory {} does not exist", event_dir.display());
    }

    let pattern = event_dir.join("*.csv");
    let pattern_str = pattern
        .to_str()
        .with_context(|| format!("event directory path {} is not valid UTF-8", event_dir.display()))?;

    let mut files: Vec<(PathBuf, Option<SystemTime>)> = Vec::new();
    for entry in glob::glob(pattern_str).context("invalid event directory pattern")? {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let modified = match path.metadata().and_then(|meta| meta.modified()) {
            Ok(modified) => Some(modified),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read mtime, ordering last");
                None
            }
        };
        files.push((path, modified));
    }

    files.sort_by(|a, b| {
        (a.1.is_none(), a.1)
            .cmp(&(b.1.is_none(), b.1))
            .then_with(|| a.0.cmp(&b.0))
    });

    Ok(files.into_iter().map(|(path, _)| path).collect())
}

/// Clear duty-status flags that have sat set for too long, usually because
/// a worker's clock-out file never arrived. Failures here only warn; the
/// sweep retries on the next run anyway.
pub async fn clear_stale_duty_status(directory: &dyn DirectorySync, older_than_hours: u32) -> usize {
    let stale = match directory.find_stale_duty_status(older_than_hours).await {
        Ok(stale) => stale,
        Err(err) => {
            warn!(error = %err, "stale duty-status lookup failed");
            return 0;
        }
    };
    if stale.is_empty() {
        return 0;
    }

    info!(users = stale.len(), older_than_hours, "clearing stale duty-status flags");
    match directory.bulk_clear_duty_status(&stale).await {
        Ok(results) => {
            let cleared = results.values().filter(|ok| **ok).count();
            if cleared < stale.len() {
                warn!(
                    requested = stale.len(),
                    cleared, "some stale flags were not cleared"
                );
            }
            cleared
        }
        Err(err) => {
            warn!(error = %err, "stale duty-status clear failed");
            0
        }
    }
}
