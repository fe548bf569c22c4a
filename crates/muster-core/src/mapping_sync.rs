use chrono::{NaiveDateTime, Timelike};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::directory::{DirectoryError, DirectorySync};
use crate::store::{MappingStore, StoreError, SyncRecord, SyncStatus, MAPPING_SYNC_TYPE};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("mapping store: {0}")]
    Store(#[from] StoreError),

    #[error("directory fetch: {0}")]
    Directory(#[from] DirectoryError),
}

/// Whether the worker mapping refresh should run now. Due when the last
/// recorded sync is older than the retry window, when the last attempt did
/// not complete cleanly, or once per day after the configured hour.
pub fn refresh_due(
    now: NaiveDateTime,
    last: Option<&SyncRecord>,
    sync_hour: u32,
    retry_days: i64,
) -> bool {
    let Some(last) = last else {
        return true;
    };
    if (now.date() - last.last_sync_date).num_days() > retry_days {
        return true;
    }
    if last.status != SyncStatus::Completed {
        return true;
    }
    if now.hour() < sync_hour {
        return false;
    }
    last.last_sync_date != now.date()
}

/// Run the refresh if the schedule says so. Returns whether it ran.
pub async fn refresh_if_due(
    store: &MappingStore,
    directory: &dyn DirectorySync,
    config: &Config,
    now: NaiveDateTime,
) -> Result<bool, RefreshError> {
    if !config.sync_mappings {
        return Ok(false);
    }
    let last = store.sync_record(MAPPING_SYNC_TYPE).await?;
    if !refresh_due(
        now,
        last.as_ref(),
        config.mapping_sync_hour,
        config.mapping_retry_days,
    ) {
        debug!("worker mapping refresh not due");
        return Ok(false);
    }
    refresh_worker_mappings(store, directory, config).await?;
    Ok(true)
}

/// Pull the full remote user directory and rebuild the local mapping table
/// in one swap. An empty or unusable listing records `no_data` and leaves
/// the existing table untouched; a fetch error records `error` first and
/// then propagates.
pub async fn refresh_worker_mappings(
    store: &MappingStore,
    directory: &dyn DirectorySync,
    config: &Config,
) -> Result<u64, RefreshError> {
    let fields = config.fetch_fields();
    info!("refreshing worker mappings from the directory");

    let users = match directory.fetch_users_with_attributes(&fields).await {
        Ok(users) => users,
        Err(err) => {
            store
                .record_sync(MAPPING_SYNC_TYPE, SyncStatus::Error)
                .await?;
            return Err(err.into());
        }
    };

    let mappings: Vec<(String, String)> = users
        .iter()
        .filter_map(|user| {
            let worker_id = user.attributes.get(&config.worker_id_field)?.trim();
            if worker_id.is_empty() {
                return None;
            }
            Some((worker_id.to_string(), user.username.clone()))
        })
        .collect();

    if mappings.is_empty() {
        warn!(
            users = users.len(),
            "directory returned no usable worker mappings, keeping current table"
        );
        store
            .record_sync(MAPPING_SYNC_TYPE, SyncStatus::NoData)
            .await?;
        return Ok(0);
    }

    let count = store.replace_mappings(&mappings).await?;
    store
        .record_sync(MAPPING_SYNC_TYPE, SyncStatus::Completed)
        .await?;
    info!(mappings = count, "worker mapping refresh complete");
    Ok(count)
}
