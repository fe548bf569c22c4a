use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::reconcile::{BatchFile, BatchReconciliation, ParseStatus};
use crate::store::{MappingStore, StoreError};

/// Why a file had no say in the upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileResolution {
    /// No usable events at all.
    Empty,
    /// Events present but not one worker resolved to a username. Usually a
    /// sign the mapping table is stale, so it is logged loudly.
    Unmapped,
    Resolved,
}

impl FileResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileResolution::Empty => "empty",
            FileResolution::Unmapped => "unmapped",
            FileResolution::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Settled successfully and moved to the archive directory.
    Archived,
    /// Settled successfully; moving is disabled or the move failed.
    LeftInPlace,
    /// Failed this pass, counter bumped, file stays for the next run.
    RetryScheduled { attempt: u32, max: u32 },
    /// Retry budget exhausted, file moved out of the event directory.
    Quarantined,
    /// The file itself was unreadable. No counter traffic; it stays put
    /// until someone fixes or removes it.
    ParseFailure,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Archived => "archived",
            Disposition::LeftInPlace => "left_in_place",
            Disposition::RetryScheduled { .. } => "retry_scheduled",
            Disposition::Quarantined => "quarantined",
            Disposition::ParseFailure => "parse_failure",
        }
    }
}

#[derive(Debug)]
pub struct FileOutcome {
    pub filename: String,
    pub resolution: FileResolution,
    pub success: bool,
    pub disposition: Disposition,
    pub events: usize,
    pub workers: usize,
}

/// A file succeeds when it has no resolvable workers, or when every one of
/// its resolvable workers succeeded upstream. Usernames missing from the
/// result map count as failures.
pub fn file_succeeded(file: &BatchFile, results: &HashMap<String, bool>) -> bool {
    file.usernames.is_empty()
        || file
            .usernames
            .iter()
            .all(|username| results.get(username).copied().unwrap_or(false))
}

pub fn file_resolution(file: &BatchFile) -> FileResolution {
    if file.events.is_empty() {
        FileResolution::Empty
    } else if file.usernames.is_empty() {
        FileResolution::Unmapped
    } else {
        FileResolution::Resolved
    }
}

/// Apply the per-file lifecycle for a reconciled batch: clear or bump retry
/// counters, move files, and append the audit log. Runs strictly after the
/// upstream call so a crash before this point leaves every file untouched.
/// Filesystem problems are logged and absorbed; store errors propagate.
pub async fn settle_batch(
    store: &MappingStore,
    config: &Config,
    batch: &BatchReconciliation,
) -> Result<Vec<FileOutcome>, StoreError> {
    let mut outcomes = Vec::with_capacity(batch.files.len());
    for file in &batch.files {
        outcomes.push(settle_file(store, config, file, &batch.results).await?);
    }
    Ok(outcomes)
}

async fn settle_file(
    store: &MappingStore,
    config: &Config,
    file: &BatchFile,
    results: &HashMap<String, bool>,
) -> Result<FileOutcome, StoreError> {
    let resolution = file_resolution(file);

    if file.status == ParseStatus::ParseError {
        error!(file = %file.filename, "unparseable file left in place");
        store
            .append_log(&file.filename, 0, 0, Disposition::ParseFailure.as_str(), None)
            .await?;
        return Ok(FileOutcome {
            filename: file.filename.clone(),
            resolution,
            success: false,
            disposition: Disposition::ParseFailure,
            events: 0,
            workers: 0,
        });
    }

    let success = file_succeeded(file, results);
    let disposition = if success {
        settle_success(store, config, file, resolution).await?
    } else {
        settle_failure(store, config, file).await?
    };

    store
        .append_log(
            &file.filename,
            file.events.len() as i64,
            file.usernames.len() as i64,
            disposition.as_str(),
            settle_detail(file, resolution, &disposition).as_deref(),
        )
        .await?;

    Ok(FileOutcome {
        filename: file.filename.clone(),
        resolution,
        success,
        disposition,
        events: file.events.len(),
        workers: file.usernames.len(),
    })
}

async fn settle_success(
    store: &MappingStore,
    config: &Config,
    file: &BatchFile,
    resolution: FileResolution,
) -> Result<Disposition, StoreError> {
    store.clear_retries(&file.filename).await?;

    match resolution {
        FileResolution::Empty => info!(file = %file.filename, "file had no usable events"),
        FileResolution::Unmapped => warn!(
            file = %file.filename,
            workers = file.unmapped.len(),
            "file settled without any mapped workers, mapping table may be stale"
        ),
        FileResolution::Resolved => info!(
            file = %file.filename,
            workers = file.usernames.len(),
            "file settled successfully"
        ),
    }

    if !config.move_archived {
        return Ok(Disposition::LeftInPlace);
    }

    match move_with_suffix(&file.path, &config.archive_dir) {
        Ok(dest) => {
            info!(file = %file.filename, dest = %dest.display(), "archived");
            Ok(Disposition::Archived)
        }
        Err(err) => {
            warn!(
                file = %file.filename,
                error = %err,
                "archive move failed, file left in place"
            );
            Ok(Disposition::LeftInPlace)
        }
    }
}

async fn settle_failure(
    store: &MappingStore,
    config: &Config,
    file: &BatchFile,
) -> Result<Disposition, StoreError> {
    let attempt = store.record_retry(&file.filename).await?;
    let max = config.max_retry_attempts;

    if attempt < max {
        warn!(
            file = %file.filename,
            attempt,
            max,
            "file failed to settle, will retry next pass"
        );
        return Ok(Disposition::RetryScheduled { attempt, max });
    }

    match move_with_suffix(&file.path, &config.quarantine_dir) {
        Ok(dest) => {
            store.clear_retries(&file.filename).await?;
            error!(
                file = %file.filename,
                attempts = attempt,
                dest = %dest.display(),
                "retry budget exhausted, file quarantined"
            );
            Ok(Disposition::Quarantined)
        }
        Err(err) => {
            error!(
                file = %file.filename,
                error = %err,
                "quarantine move failed, file left in place"
            );
            Ok(Disposition::RetryScheduled { attempt, max })
        }
    }
}

fn settle_detail(
    file: &BatchFile,
    resolution: FileResolution,
    disposition: &Disposition,
) -> Option<String> {
    match disposition {
        Disposition::RetryScheduled { attempt, max } => Some(format!("attempt {attempt}/{max}")),
        Disposition::Quarantined => Some("retry budget exhausted".to_string()),
        _ => match resolution {
            FileResolution::Unmapped => Some(format!("{} unmapped workers", file.unmapped.len())),
            _ => None,
        },
    }
}

/// Move a file into `dest_dir`, never overwriting: a name collision gets a
/// timestamp suffix, and a further collision a numeric one. Falls back to
/// copy-and-delete when a direct rename crosses filesystems.
pub fn move_with_suffix(source: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dest_dir)?;

    let name = source
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no filename"))?
        .to_string_lossy()
        .into_owned();

    let mut dest = dest_dir.join(&name);
    if dest.exists() {
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) => (stem.to_string(), format!(".{ext}")),
            None => (name.clone(), String::new()),
        };
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        dest = dest_dir.join(format!("{stem}_{stamp}{ext}"));
        let mut counter = 1u32;
        while dest.exists() {
            dest = dest_dir.join(format!("{stem}_{stamp}_{counter}{ext}"));
            counter += 1;
        }
    }

    match fs::rename(source, &dest) {
        Ok(()) => Ok(dest),
        Err(_) => {
            fs::copy(source, &dest)?;
            fs::remove_file(source)?;
            Ok(dest)
        }
    }
}
