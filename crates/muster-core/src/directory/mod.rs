use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;

mod http;

pub use http::HttpDirectoryClient;

/// Wire format for duty-status timestamps in the directory service.
pub const DUTY_TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// One worker's desired duty status. `None` clears the field.
#[derive(Debug, Clone, PartialEq)]
pub struct DutyUpdate {
    pub username: String,
    pub on_duty_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryUser {
    pub username: String,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("authentication with the directory service failed: {0}")]
    Auth(String),

    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected directory response: {0}")]
    BadResponse(String),
}

/// Everything the engine needs from the remote directory service. Cut as a
/// trait so tests can stand in a recording fake.
#[async_trait]
pub trait DirectorySync: Send + Sync {
    /// One consolidated duty-status write. Returns per-username success;
    /// callers must treat usernames missing from the map as failed.
    async fn bulk_set_duty_status(
        &self,
        updates: &[DutyUpdate],
    ) -> Result<HashMap<String, bool>, DirectoryError>;

    /// Complete user listing carrying the requested attribute fields.
    async fn fetch_users_with_attributes(
        &self,
        fields: &[String],
    ) -> Result<Vec<DirectoryUser>, DirectoryError>;

    /// Usernames whose duty status has not moved within the window.
    async fn find_stale_duty_status(
        &self,
        older_than_hours: u32,
    ) -> Result<Vec<String>, DirectoryError>;

    /// Clear duty status for the given users in one write.
    async fn bulk_clear_duty_status(
        &self,
        usernames: &[String],
    ) -> Result<HashMap<String, bool>, DirectoryError> {
        let updates: Vec<DutyUpdate> = usernames
            .iter()
            .map(|username| DutyUpdate {
                username: username.clone(),
                on_duty_at: None,
            })
            .collect();
        self.bulk_set_duty_status(&updates).await
    }
}
