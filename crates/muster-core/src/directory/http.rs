use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DirectoryConfig;

use super::{DirectoryError, DirectorySync, DirectoryUser, DutyUpdate, DUTY_TIMESTAMP_FORMAT};

const TOKEN_ATTEMPTS: u32 = 3;
const TOKEN_BACKOFF_START: Duration = Duration::from_secs(4);
const TOKEN_BACKOFF_CAP: Duration = Duration::from_secs(10);
const SEARCH_PAGE_SIZE: usize = 500;

/// Directory client over the org-scoped HTTP API. Authenticates eagerly
/// with an OAuth2 password grant; construction fails if no token can be
/// obtained, which callers treat as a fatal setup error.
pub struct HttpDirectoryClient {
    http: reqwest::Client,
    base_url: String,
    org_code: String,
    duty_field: String,
    bulk_timeout: Duration,
    token: String,
}

impl HttpDirectoryClient {
    pub async fn connect(
        config: &DirectoryConfig,
        duty_field: &str,
    ) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        let token = fetch_token(&http, config).await?;
        info!(org = %config.org_code, "authenticated with directory service");

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            org_code: config.org_code.clone(),
            duty_field: duty_field.to_string(),
            bulk_timeout: config.bulk_timeout,
            token,
        })
    }

    fn org_url(&self, suffix: &str) -> String {
        format!("{}/api/v2/orgs/{}/{}", self.base_url, self.org_code, suffix)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Serialize)]
struct BulkDutyRequest<'a> {
    field: &'a str,
    updates: Vec<DutyUpdateBody>,
}

#[derive(Serialize)]
struct DutyUpdateBody {
    username: String,
    /// Serialized even when null so the directory clears the field.
    value: Option<String>,
}

#[derive(Deserialize)]
struct BulkDutyResponse {
    results: HashMap<String, bool>,
}

#[derive(Deserialize)]
struct UserSearchResponse {
    users: Vec<UserBody>,
}

#[derive(Deserialize)]
struct UserBody {
    username: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Deserialize)]
struct StaleDutyResponse {
    users: Vec<String>,
}

async fn fetch_token(
    http: &reqwest::Client,
    config: &DirectoryConfig,
) -> Result<String, DirectoryError> {
    let url = format!("{}/auth/token", config.base_url.trim_end_matches('/'));
    let acr_values = format!("tenant:{}", config.org_code);
    let params = [
        ("grant_type", "password"),
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("username", config.username.as_str()),
        ("password", config.password.as_str()),
        ("acr_values", acr_values.as_str()),
    ];

    let mut delay = TOKEN_BACKOFF_START;
    let mut last_error = String::new();
    for attempt in 1..=TOKEN_ATTEMPTS {
        match http.post(&url).form(&params).send().await {
            Ok(response) if response.status().is_success() => {
                let body: TokenResponse = response.json().await?;
                return Ok(body.access_token);
            }
            Ok(response) => {
                last_error = format!("token endpoint returned {}", response.status());
            }
            Err(err) => {
                last_error = err.to_string();
            }
        }
        if attempt < TOKEN_ATTEMPTS {
            warn!(attempt, error = %last_error, "token fetch failed, backing off");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(TOKEN_BACKOFF_CAP);
        }
    }
    Err(DirectoryError::Auth(last_error))
}

async fn ensure_success(
    response: reqwest::Response,
    operation: &str,
) -> Result<reqwest::Response, DirectoryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(DirectoryError::BadResponse(format!(
        "{operation} returned {status}: {}",
        detail.chars().take(200).collect::<String>()
    )))
}

#[async_trait]
impl DirectorySync for HttpDirectoryClient {
    async fn bulk_set_duty_status(
        &self,
        updates: &[DutyUpdate],
    ) -> Result<HashMap<String, bool>, DirectoryError> {
        if updates.is_empty() {
            return Ok(HashMap::new());
        }

        let body = BulkDutyRequest {
            field: &self.duty_field,
            updates: updates
                .iter()
                .map(|update| DutyUpdateBody {
                    username: update.username.clone(),
                    value: update
                        .on_duty_at
                        .map(|at| at.format(DUTY_TIMESTAMP_FORMAT).to_string()),
                })
                .collect(),
        };

        debug!(updates = updates.len(), "sending bulk duty-status update");
        let response = self
            .http
            .post(self.org_url("users/duty-status/sync"))
            .bearer_auth(&self.token)
            .timeout(self.bulk_timeout)
            .json(&body)
            .send()
            .await?;
        let response = ensure_success(response, "duty-status sync").await?;
        let body: BulkDutyResponse = response.json().await?;
        Ok(body.results)
    }

    async fn fetch_users_with_attributes(
        &self,
        fields: &[String],
    ) -> Result<Vec<DirectoryUser>, DirectoryError> {
        let field_list = fields.join(",");
        let mut users = Vec::new();
        let mut offset = 0usize;

        loop {
            let limit = SEARCH_PAGE_SIZE.to_string();
            let offset_param = offset.to_string();
            let response = self
                .http
                .get(self.org_url("users/search"))
                .bearer_auth(&self.token)
                .query(&[
                    ("fields", field_list.as_str()),
                    ("limit", limit.as_str()),
                    ("offset", offset_param.as_str()),
                ])
                .send()
                .await?;
            let response = ensure_success(response, "user search").await?;
            let page: UserSearchResponse = response.json().await?;

            let fetched = page.users.len();
            debug!(offset, fetched, "fetched directory user page");
            users.extend(page.users.into_iter().map(|user| DirectoryUser {
                username: user.username,
                attributes: user.attributes,
            }));

            if fetched < SEARCH_PAGE_SIZE {
                break;
            }
            offset += fetched;
        }

        Ok(users)
    }

    async fn find_stale_duty_status(
        &self,
        older_than_hours: u32,
    ) -> Result<Vec<String>, DirectoryError> {
        let window = older_than_hours.to_string();
        let response = self
            .http
            .get(self.org_url("users/duty-status/stale"))
            .bearer_auth(&self.token)
            .query(&[
                ("field", self.duty_field.as_str()),
                ("older_than_hours", window.as_str()),
            ])
            .send()
            .await?;
        let response = ensure_success(response, "stale duty-status search").await?;
        let body: StaleDutyResponse = response.json().await?;
        Ok(body.users)
    }
}
