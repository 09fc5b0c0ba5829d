//! PostgREST-compatible remote store.
//!
//! Talks to a hosted Postgres through its REST gateway. Expected tables:
//!
//! - `check_ins(id uuid, sequence bigint identity, user_id, event_id, type,
//!   timestamp timestamptz default now(), latitude, longitude)`
//! - `registrations(id, user_id, event_id, status)`
//! - `events(id, latitude, longitude, radius_meters, starts_at, ends_at)`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{Result, RollcallError};
use crate::repository::{NewCheckIn, RemoteError, RemoteResult, RemoteStore};
use crate::types::{CheckInRecord, CheckInType, Event, Registration};

const REST_PREFIX: &str = "rest/v1/";

/// HTTP client for a PostgREST backend.
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct CheckInRow<'a> {
    user_id: &'a str,
    event_id: &'a str,
    #[serde(rename = "type")]
    kind: CheckInType,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Deserialize)]
struct EmbeddedEvent {
    event: Option<Event>,
}

impl RestStore {
    /// Creates a client for `base_url`.
    ///
    /// `request_timeout` caps the transport; the repository applies its own
    /// deadline on top.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidationError` for an unparsable URL.
    pub fn new(base_url: &str, api_key: Option<String>, request_timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url).map_err(|e| {
            RollcallError::ConfigValidationError(format!("store.base_url: {e}"))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RollcallError::ConfigValidationError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// Builds a store from the `[store]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidationError` if `base_url` is missing or invalid.
    pub fn from_config(config: &StoreConfig, request_timeout: Duration) -> Result<Self> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            RollcallError::ConfigValidationError("store.base_url is required".into())
        })?;
        Self::new(base_url, config.api_key.clone(), request_timeout)
    }

    fn table_url(&self, table: &str) -> RemoteResult<Url> {
        self.base_url
            .join(REST_PREFIX)
            .and_then(|url| url.join(table))
            .map_err(|e| RemoteError::Decode(format!("invalid table URL: {e}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

/// Maps a store status code onto the remote error taxonomy.
fn classify_status(status: StatusCode, body: String) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(body),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Network(format!("{s}: {body}"))
        }
        s => RemoteError::Rejected {
            status: s.as_u16(),
            message: body,
        },
    }
}

async fn check_status(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, body))
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn insert_check_in(&self, draft: NewCheckIn) -> RemoteResult<CheckInRecord> {
        let row = CheckInRow {
            user_id: &draft.user_id,
            event_id: &draft.event_id,
            kind: draft.kind,
            latitude: draft.position.map(|p| p.latitude),
            longitude: draft.position.map(|p| p.longitude),
        };
        let request = self
            .client
            .post(self.table_url("check_ins")?)
            .header("Prefer", "return=representation")
            .json(&row);

        let mut rows: Vec<CheckInRecord> = self.fetch(request).await?;
        debug!(event_id = %draft.event_id, rows = rows.len(), "Inserted check-in row");
        rows.pop()
            .ok_or_else(|| RemoteError::Decode("insert returned no row".into()))
    }

    async fn check_ins(&self, user_id: &str, event_id: &str) -> RemoteResult<Vec<CheckInRecord>> {
        let request = self.client.get(self.table_url("check_ins")?).query(&[
            ("user_id", format!("eq.{user_id}")),
            ("event_id", format!("eq.{event_id}")),
            ("order", "sequence.asc".to_string()),
        ]);
        self.fetch(request).await
    }

    async fn event_check_ins(&self, event_id: &str) -> RemoteResult<Vec<CheckInRecord>> {
        let request = self.client.get(self.table_url("check_ins")?).query(&[
            ("event_id", format!("eq.{event_id}")),
            ("order", "sequence.asc".to_string()),
        ]);
        self.fetch(request).await
    }

    async fn registration(
        &self,
        user_id: &str,
        event_id: &str,
    ) -> RemoteResult<Option<Registration>> {
        let request = self.client.get(self.table_url("registrations")?).query(&[
            ("user_id", format!("eq.{user_id}")),
            ("event_id", format!("eq.{event_id}")),
            ("limit", "1".to_string()),
        ]);
        let mut rows: Vec<Registration> = self.fetch(request).await?;
        Ok(rows.pop())
    }

    async fn registered_events(&self, user_id: &str) -> RemoteResult<Vec<Event>> {
        let request = self.client.get(self.table_url("registrations")?).query(&[
            ("user_id", format!("eq.{user_id}")),
            ("status", "neq.cancelled".to_string()),
            ("select", "event:events(*)".to_string()),
        ]);
        let rows: Vec<EmbeddedEvent> = self.fetch(request).await?;
        Ok(rows.into_iter().filter_map(|row| row.event).collect())
    }
}
