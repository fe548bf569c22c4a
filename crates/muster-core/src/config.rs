use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Runtime settings, read once at startup and never mutated. Components
/// borrow the pieces they need instead of reaching into the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory polled for incoming clock files.
    pub event_dir: PathBuf,
    /// Where successfully settled files go when moving is enabled.
    pub archive_dir: PathBuf,
    /// Terminal directory for files that exhausted their retry budget.
    pub quarantine_dir: PathBuf,
    pub move_archived: bool,
    pub db_path: PathBuf,
    pub batch_size: usize,
    pub max_retry_attempts: u32,
    pub stale_after_hours: u32,
    pub sync_mappings: bool,
    /// Local hour of day after which the daily mapping refresh may run.
    pub mapping_sync_hour: u32,
    /// Days without a recorded refresh before one is forced.
    pub mapping_retry_days: i64,
    /// Directory attribute carrying the worker id.
    pub worker_id_field: String,
    /// Extra attributes fetched alongside the worker id.
    pub user_attributes: Vec<String>,
    /// Directory field holding the duty-status timestamp.
    pub duty_status_field: String,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub org_code: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub http_timeout: Duration,
    pub bulk_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let event_dir = PathBuf::from(required("MUSTER_EVENT_DIR")?);
        let archive_dir = optional("MUSTER_ARCHIVE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| event_dir.join("processed"));
        let quarantine_dir = optional("MUSTER_QUARANTINE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| event_dir.join("failed"));

        let config = Config {
            event_dir,
            archive_dir,
            quarantine_dir,
            move_archived: parse_or("MUSTER_MOVE_ARCHIVED", false, parse_bool)?,
            db_path: optional("MUSTER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("muster.db")),
            batch_size: parse_or("MUSTER_BATCH_SIZE", 10, parse_from_str)?,
            max_retry_attempts: parse_or("MUSTER_MAX_RETRY_ATTEMPTS", 5, parse_from_str)?,
            stale_after_hours: parse_or("MUSTER_STALE_AFTER_HOURS", 24, parse_from_str)?,
            sync_mappings: parse_or("MUSTER_SYNC_MAPPINGS", true, parse_bool)?,
            mapping_sync_hour: parse_or("MUSTER_MAPPING_SYNC_HOUR", 20, parse_from_str)?,
            mapping_retry_days: parse_or("MUSTER_MAPPING_RETRY_DAYS", 2, parse_from_str)?,
            worker_id_field: optional("MUSTER_WORKER_ID_FIELD")
                .unwrap_or_else(|| "COLLAR_ID".to_string()),
            user_attributes: parse_list(
                &optional("MUSTER_USER_ATTRIBUTES")
                    .unwrap_or_else(|| "FIRSTNAME,LASTNAME".to_string()),
            ),
            duty_status_field: optional("MUSTER_DUTY_STATUS_FIELD")
                .unwrap_or_else(|| "On-Duty-DTG".to_string()),
            directory: DirectoryConfig {
                base_url: required("DIRECTORY_BASE_URL")?,
                org_code: required("DIRECTORY_ORG_CODE")?,
                client_id: required("DIRECTORY_CLIENT_ID")?,
                client_secret: required("DIRECTORY_CLIENT_SECRET")?,
                username: required("DIRECTORY_USERNAME")?,
                password: required("DIRECTORY_PASSWORD")?,
                http_timeout: Duration::from_secs(parse_or(
                    "DIRECTORY_HTTP_TIMEOUT_SECS",
                    30,
                    parse_from_str,
                )?),
                bulk_timeout: Duration::from_secs(parse_or(
                    "DIRECTORY_BULK_TIMEOUT_SECS",
                    120,
                    parse_from_str,
                )?),
            },
        };
        config.validate()
    }

    /// Attribute fields requested from the directory during a mapping
    /// refresh. The worker id field always leads the list.
    pub fn fetch_fields(&self) -> Vec<String> {
        let mut fields = vec![self.worker_id_field.clone()];
        for attr in &self.user_attributes {
            if !fields.iter().any(|f| f.eq_ignore_ascii_case(attr)) {
                fields.push(attr.clone());
            }
        }
        fields
    }

    fn validate(self) -> Result<Self> {
        if self.batch_size == 0 {
            bail!("MUSTER_BATCH_SIZE must be at least 1");
        }
        if self.max_retry_attempts == 0 {
            bail!("MUSTER_MAX_RETRY_ATTEMPTS must be at least 1");
        }
        if self.mapping_sync_hour > 23 {
            bail!("MUSTER_MAPPING_SYNC_HOUR must be an hour of day (0-23)");
        }
        if self.worker_id_field.trim().is_empty() {
            bail!("MUSTER_WORKER_ID_FIELD must not be empty");
        }
        if self.duty_status_field.trim().is_empty() {
            bail!("MUSTER_DUTY_STATUS_FIELD must not be empty");
        }
        Ok(self)
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{name} environment variable is not set"))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or<T, F>(name: &str, default: T, parse: F) -> Result<T>
where
    F: Fn(&str) -> Result<T, String>,
{
    match optional(name) {
        Some(raw) => parse(&raw).map_err(|err| anyhow::anyhow!("{name}: {err}")),
        None => Ok(default),
    }
}

fn parse_from_str<T>(value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| format!("could not parse '{value}': {err}"))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("could not parse '{other}' as a boolean")),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
impl Config {
    /// Baseline settings for unit tests; fields are tweaked per test.
    pub(crate) fn for_tests() -> Self {
        Config {
            event_dir: PathBuf::from("/tmp/events"),
            archive_dir: PathBuf::from("/tmp/events/processed"),
            quarantine_dir: PathBuf::from("/tmp/events/failed"),
            move_archived: true,
            db_path: PathBuf::from(":memory:"),
            batch_size: 10,
            max_retry_attempts: 5,
            stale_after_hours: 24,
            sync_mappings: true,
            mapping_sync_hour: 20,
            mapping_retry_days: 2,
            worker_id_field: "COLLAR_ID".to_string(),
            user_attributes: vec!["FIRSTNAME".to_string(), "LASTNAME".to_string()],
            duty_status_field: "On-Duty-DTG".to_string(),
            directory: DirectoryConfig {
                base_url: "http://localhost:0".to_string(),
                org_code: "TEST".to_string(),
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
                username: "svc".to_string(),
                password: "pw".to_string(),
                http_timeout: Duration::from_secs(5),
                bulk_timeout: Duration::from_secs(10),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_booleans_loosely() {
        assert_eq!(parse_bool("true"), Ok(true));
        assert_eq!(parse_bool("Yes"), Ok(true));
        assert_eq!(parse_bool("0"), Ok(false));
        assert!(parse_bool("sometimes").is_err());
    }

    #[test]
    fn splits_attribute_lists() {
        assert_eq!(
            parse_list("COLLAR_ID, FIRSTNAME ,,LASTNAME"),
            vec!["COLLAR_ID", "FIRSTNAME", "LASTNAME"]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn fetch_fields_leads_with_worker_id_without_duplicates() {
        let mut config = Config::for_tests();
        config.worker_id_field = "COLLAR_ID".to_string();
        config.user_attributes = vec!["collar_id".to_string(), "LASTNAME".to_string()];
        assert_eq!(config.fetch_fields(), vec!["COLLAR_ID", "LASTNAME"]);
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = Config::for_tests();
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
