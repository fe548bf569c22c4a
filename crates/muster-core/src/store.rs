use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::Row;
use thiserror::Error;

use muster_parser::WorkerId;

use crate::db::DbPool;

/// Row key in `sync_tracking` for the worker mapping refresh.
pub const MAPPING_SYNC_TYPE: &str = "worker_mapping";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid sync status value '{0}'")]
    InvalidSyncStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Completed,
    Error,
    NoData,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Completed => "completed",
            SyncStatus::Error => "error",
            SyncStatus::NoData => "no_data",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "no_data" => Some(Self::NoData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub sync_type: String,
    pub last_sync_date: NaiveDate,
    pub last_sync_time: NaiveTime,
    pub status: SyncStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerMapping {
    pub worker_id: String,
    pub username: String,
    pub last_updated: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryRecord {
    pub filename: String,
    pub retry_count: u32,
    pub first_seen: NaiveDateTime,
    pub last_retry: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub filename: String,
    pub processed_at: NaiveDateTime,
    pub events: i64,
    pub workers: i64,
    pub outcome: String,
    pub detail: Option<String>,
}

/// All local persistence behind one handle: worker mappings, sync
/// bookkeeping, the file retry ledger, and the processing audit log. The
/// engine components never run SQL themselves.
#[derive(Clone)]
pub struct MappingStore {
    pool: DbPool,
}

impl MappingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn username_for_worker(
        &self,
        worker: &WorkerId,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT username FROM worker_mapping WHERE worker_id = ?")
            .bind(worker.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("username")?),
            None => None,
        })
    }

    /// Swap the whole mapping table for the given `(worker_id, username)`
    /// pairs in one transaction. Later duplicates of a worker id win.
    pub async fn replace_mappings(&self, mappings: &[(String, String)]) -> Result<u64, StoreError> {
        let now = Local::now().naive_local();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM worker_mapping")
            .execute(&mut *tx)
            .await?;

        for (worker_id, username) in mappings {
            sqlx::query(
                r#"
                INSERT INTO worker_mapping (worker_id, username, last_updated)
                VALUES (?, ?, ?)
                ON CONFLICT (worker_id) DO UPDATE SET
                    username = excluded.username,
                    last_updated = excluded.last_updated
                "#,
            )
            .bind(worker_id)
            .bind(username)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.mapping_count().await
    }

    pub async fn mapping_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM worker_mapping")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count as u64)
    }

    pub async fn all_mappings(&self) -> Result<Vec<WorkerMapping>, StoreError> {
        let rows = sqlx::query(
            "SELECT worker_id, username, last_updated FROM worker_mapping ORDER BY worker_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(WorkerMapping {
                    worker_id: row.try_get("worker_id")?,
                    username: row.try_get("username")?,
                    last_updated: row.try_get("last_updated")?,
                })
            })
            .collect()
    }

    pub async fn sync_record(&self, sync_type: &str) -> Result<Option<SyncRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT sync_type, last_sync_date, last_sync_time, status
            FROM sync_tracking
            WHERE sync_type = ?
            "#,
        )
        .bind(sync_type)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_str: String = row.try_get("status")?;
        let status = SyncStatus::from_str(&status_str)
            .ok_or_else(|| StoreError::InvalidSyncStatus(status_str.clone()))?;

        Ok(Some(SyncRecord {
            sync_type: row.try_get("sync_type")?,
            last_sync_date: row.try_get("last_sync_date")?,
            last_sync_time: row.try_get("last_sync_time")?,
            status,
        }))
    }

    pub async fn record_sync(&self, sync_type: &str, status: SyncStatus) -> Result<(), StoreError> {
        let now = Local::now();
        sqlx::query(
            r#"
            INSERT INTO sync_tracking (sync_type, last_sync_date, last_sync_time, status)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (sync_type) DO UPDATE SET
                last_sync_date = excluded.last_sync_date,
                last_sync_time = excluded.last_sync_time,
                status = excluded.status
            "#,
        )
        .bind(sync_type)
        .bind(now.date_naive())
        .bind(now.time())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attempts recorded so far for a file; zero when untracked.
    pub async fn retry_attempts(&self, filename: &str) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT retry_count FROM file_retry_tracking WHERE filename = ?")
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get::<i64, _>("retry_count")? as u32,
            None => 0,
        })
    }

    /// Record one more failed attempt and return the new count.
    pub async fn record_retry(&self, filename: &str) -> Result<u32, StoreError> {
        let now = Local::now().naive_local();
        let row = sqlx::query(
            r#"
            INSERT INTO file_retry_tracking (filename, retry_count, first_seen, last_retry)
            VALUES (?, 1, ?, ?)
            ON CONFLICT (filename) DO UPDATE SET
                retry_count = retry_count + 1,
                last_retry = excluded.last_retry
            RETURNING retry_count
            "#,
        )
        .bind(filename)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("retry_count")? as u32)
    }

    pub async fn clear_retries(&self, filename: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM file_retry_tracking WHERE filename = ?")
            .bind(filename)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn all_retries(&self) -> Result<Vec<RetryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT filename, retry_count, first_seen, last_retry
            FROM file_retry_tracking
            ORDER BY last_retry DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(RetryRecord {
                    filename: row.try_get("filename")?,
                    retry_count: row.try_get::<i64, _>("retry_count")? as u32,
                    first_seen: row.try_get("first_seen")?,
                    last_retry: row.try_get("last_retry")?,
                })
            })
            .collect()
    }

    pub async fn append_log(
        &self,
        filename: &str,
        events: i64,
        workers: i64,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO processing_log (filename, processed_at, events, workers, outcome, detail)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(filename)
        .bind(Local::now().naive_local())
        .bind(events)
        .bind(workers)
        .bind(outcome)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_log(&self, limit: i64) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT filename, processed_at, events, workers, outcome, detail
            FROM processing_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(LogEntry {
                    filename: row.try_get("filename")?,
                    processed_at: row.try_get("processed_at")?,
                    events: row.try_get("events")?,
                    workers: row.try_get("workers")?,
                    outcome: row.try_get("outcome")?,
                    detail: row.try_get("detail")?,
                })
            })
            .collect()
    }
}
