//! HTTP client for the rider backend.
//!
//! [`BackendClient`] wraps `reqwest::Client` and knows the two endpoints the
//! tracker talks to:
//!
//! | Method | Path                  | Purpose                          |
//! |--------|-----------------------|----------------------------------|
//! | GET    | `/api/rider/tracking` | remote start/stop switch         |
//! | POST   | `/api/rider/location` | one GPS fix `{latitude, longitude}` |
//!
//! Both use `Authorization: Bearer <rider token>`. The token is passed per
//! call rather than stored: it lives in the persisted tracking state and can
//! be revoked at any time.
//!
//! ## Error handling
//!
//! Non-2xx responses become [`BackendError::Status`], with the message taken
//! from a JSON `message`/`error` field when present, else the raw body.
//! HTTP 401 is the one status callers treat specially, see
//! [`BackendError::is_unauthorized`].

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use serde_json::{json, Value};

use crate::config::BackendConfig;
use crate::sampler::GpsFix;

/// Errors returned by [`BackendClient`] methods.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Transport failure (connection refused, timeout, DNS, TLS...).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The backend answered with a non-2xx status.
    #[error("backend error (HTTP {status}): {message}")]
    Status { status: u16, message: String },
    /// The response body could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// `true` for HTTP 401: the rider token is no longer valid.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BackendError::Status { status: 401, .. })
    }

    /// HTTP status, if the backend produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            BackendError::Request(e) => e.status().map(|s| s.as_u16()),
            BackendError::Protocol(_) => None,
        }
    }
}

/// HTTP client for the rider API.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl BackendClient {
    /// Build a client from `[backend]` config.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        default_headers.insert(
            HeaderName::from_static("x-rider-client"),
            HeaderValue::from_static("rider-tracker"),
        );
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
        })
    }

    /// The backend base URL (without trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /api/rider/tracking` — raw switch payload.
    pub async fn tracking_status(&self, token: &str) -> Result<Value, BackendError> {
        let resp = self
            .http
            .get(format!("{}/api/rider/tracking", self.base_url))
            .bearer_auth(token)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::handle_response(resp).await
    }

    /// `POST /api/rider/location` — report one fix. Any 2xx is success; the
    /// body is returned when it is JSON, else `null`.
    pub async fn post_location(&self, token: &str, fix: &GpsFix) -> Result<Value, BackendError> {
        let body = json!({
            "latitude": fix.latitude,
            "longitude": fix.longitude,
        });
        let resp = self
            .http
            .post(format!("{}/api/rider/location", self.base_url))
            .bearer_auth(token)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if status.is_success() {
            Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
        } else {
            Err(Self::status_error(status.as_u16(), text))
        }
    }

    /// JSON body on success, [`BackendError`] otherwise.
    async fn handle_response(resp: reqwest::Response) -> Result<Value, BackendError> {
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| BackendError::Protocol(format!("invalid JSON from backend: {e}")))
        } else {
            Err(Self::status_error(status.as_u16(), body))
        }
    }

    fn status_error(status: u16, body: String) -> BackendError {
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v["message"]
                    .as_str()
                    .or_else(|| v["error"].as_str())
                    .map(String::from)
            })
            .unwrap_or(body);
        BackendError::Status { status, message }
    }
}
