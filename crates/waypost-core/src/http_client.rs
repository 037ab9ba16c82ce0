//! HTTP implementation of [`SyncClient`].
//!
//! Posts each [`SyncRequest`] as JSON to `{base_url}/v1/track` and decodes
//! the [`SyncResponse`]. Transport failures, status codes, and `Retry-After`
//! headers are mapped onto [`SyncError`] so the dispatcher can classify
//! them.
//!
//! # Example
//!
//! ```no_run
//! use waypost_core::http_client::HttpSyncClient;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpSyncClient::new("https://api.example.com")?
//!     .with_api_key("prj_live_123");
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tracing::debug;

use waypost_types::{SyncRequest, SyncResponse};

use crate::error::{Error, Result, SyncError};
use crate::traits::SyncClient;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the track endpoint, relative to the base URL.
pub const TRACK_PATH: &str = "/v1/track";

/// HTTP client for the tracking server.
#[derive(Debug, Clone)]
pub struct HttpSyncClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

fn normalize_base_url(base_url: &str) -> Result<String> {
    let base_url = base_url.trim_end_matches('/').to_string();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(Error::invalid_config(format!(
            "URL must start with http:// or https://, got: {}",
            base_url
        )));
    }
    Ok(base_url)
}

impl HttpSyncClient {
    /// Create a client for the server at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::invalid_config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Create a client with a custom reqwest Client.
    pub fn with_client(base_url: &str, client: Client) -> Result<Self> {
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url)?,
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Send `api_key` in the `Authorization` header.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn track_url(&self) -> String {
        format!("{}{}", self.base_url, TRACK_PATH)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else {
            SyncError::network(err.to_string())
        }
    }
}

/// Parse a `Retry-After` header given in seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> SyncError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| status.to_string());

    match SyncError::from_status(status.as_u16(), message) {
        SyncError::RateLimited { .. } => SyncError::RateLimited {
            retry_after: retry_after(headers),
        },
        other => other,
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn sync(&self, request: &SyncRequest) -> std::result::Result<SyncResponse, SyncError> {
        let url = self.track_url();
        let mut builder = self.client.post(&url).timeout(self.timeout).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let status = response.status();
        debug!("POST {} -> {}", url, status);

        if status.is_success() {
            return response
                .json::<SyncResponse>()
                .await
                .map_err(|e| SyncError::Server {
                    status: status.as_u16(),
                    message: format!("invalid response body: {e}"),
                });
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &headers, &body))
    }
}
