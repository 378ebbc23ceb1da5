//! Backend API client.
//!
//! Provides authenticated HTTP communication with the POS backend. The sync
//! engine talks to the backend only through the [`HttpExecutor`] trait so the
//! transport can be swapped out in tests.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ClientConfig, CONNECTIVITY_TIMEOUT};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
pub const API_KEY_HEADER: &str = "X-POS-API-Key";
pub const TERMINAL_HEADER: &str = "x-terminal-id";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Cannot reach backend at {0}")]
    Connectivity(String),
    #[error("Connection to {0} timed out")]
    Timeout(String),
    #[error("{message} (HTTP {status})")]
    Server { status: u16, message: String },
    #[error("{message} (HTTP {status})")]
    Rejected { status: u16, message: String },
    #[error("Invalid response from backend: {0}")]
    InvalidResponse(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// How the sync engine should treat a failed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// No network path to the backend. The action stays pending untouched.
    Connectivity,
    /// Worth retrying later; counts against the retry budget.
    Retryable,
    /// Will never succeed as-is; parked in the failed list immediately.
    Permanent,
}

impl ApiError {
    /// Build an error from a non-success status and the response body.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let code = status.as_u16();
        let message = error_message(status, body);
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || !status.is_client_error()
        {
            ApiError::Server {
                status: code,
                message,
            }
        } else {
            ApiError::Rejected {
                status: code,
                message,
            }
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ApiError::Connectivity(_) => FailureClass::Connectivity,
            ApiError::Timeout(_) | ApiError::Server { .. } | ApiError::InvalidResponse(_) => {
                FailureClass::Retryable
            }
            ApiError::Rejected { .. } | ApiError::InvalidRequest(_) => FailureClass::Permanent,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } | ApiError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Convert a `reqwest::Error` into a classified error.
fn transport_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout(url.to_string());
    }
    if err.is_builder() {
        return ApiError::InvalidRequest(format!("{url}: {err}"));
    }
    if err.is_decode() || err.is_body() {
        return ApiError::InvalidResponse(err.to_string());
    }
    ApiError::Connectivity(url.to_string())
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Backend endpoint not found".to_string(),
        409 => "Conflicting request".to_string(),
        s if s >= 500 => "Backend server error".to_string(),
        _ => "Unexpected response from backend".to_string(),
    }
}

/// Prefer the backend's own `error`/`message` field, keeping validation
/// details visible in the failed-queue UI.
fn error_message(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => {
            let message = json
                .get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| status_message(status));
            match json.get("details").or_else(|| json.get("errors")) {
                Some(details) => format!("{message}: {details}"),
                None => message,
            }
        }
        Err(_) if !trimmed.is_empty() => format!("{}: {trimmed}", status_message(status)),
        Err(_) => status_message(status),
    }
}

// ---------------------------------------------------------------------------
// URL normalisation and onboarding strings
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Decode an onboarding connection string: raw JSON, or base64/base64url of
/// a JSON object `{ "url", "key", "tid" }`.
pub fn decode_connection_string(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let standard = compact.replace('-', "+").replace('_', "/");
    let padding = (4 - standard.len() % 4) % 4;
    let padded = format!("{standard}{}", "=".repeat(padding));
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded)
        .ok()
        .filter(Value::is_object)
}

fn join_url(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with('/') {
        format!("{base}{endpoint}")
    } else {
        format!("{base}/{endpoint}")
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// The HTTP boundary: `execute(method, endpoint, body) -> response | error`.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, ApiError>;

    /// Lightweight reachability probe.
    async fn check_health(&self) -> bool;
}

/// reqwest-backed executor authenticated with the terminal's API key.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    api_key: String,
    terminal_id: Option<String>,
    client: Client,
    probe_client: Client,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to create HTTP client: {e}")))?;
        let probe_client = Client::builder()
            .timeout(CONNECTIVITY_TIMEOUT)
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: normalize_base_url(&config.base_url),
            api_key: config.api_key.clone(),
            terminal_id: config.terminal_id.clone(),
            client,
            probe_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl HttpExecutor for ApiClient {
    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, ApiError> {
        let url = join_url(&self.base_url, endpoint);
        debug!(%method, url = %url, "api request");

        let mut req = self
            .client
            .request(method, &url)
            .header(API_KEY_HEADER, &self.api_key)
            .header("Content-Type", "application/json");
        if let Some(tid) = self.terminal_id.as_deref() {
            req = req.header(TERMINAL_HEADER, tid);
        }
        if let Some(key) = idempotency_key {
            req = req.header(IDEMPOTENCY_HEADER, key);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        if !status.is_success() {
            return Err(ApiError::from_status(status, &text));
        }

        // Empty 204-style responses carry no body.
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn check_health(&self) -> bool {
        let url = join_url(&self.base_url, "/health");
        let start = Instant::now();
        match self
            .probe_client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!(
                    latency_ms = start.elapsed().as_millis() as u64,
                    "backend health check passed"
                );
                true
            }
            Ok(resp) => {
                info!(status = resp.status().as_u16(), "backend health check failed");
                false
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("pos.example.com/"), "https://pos.example.com");
        assert_eq!(normalize_base_url("localhost:8080/api/"), "http://localhost:8080");
        assert_eq!(
            normalize_base_url(" https://pos.example.com/api "),
            "https://pos.example.com"
        );
        assert_eq!(normalize_base_url("http://127.0.0.1:3000"), "http://127.0.0.1:3000");
    }

    #[test]
    fn test_decode_connection_string_variants() {
        let json = r#"{"url":"pos.example.com","key":"k-123","tid":"t-1"}"#;
        assert_eq!(decode_connection_string(json).unwrap()["key"], "k-123");

        let encoded = BASE64_STANDARD.encode(json);
        let urlsafe = encoded.replace('+', "-").replace('/', "_").replace('=', "");
        assert_eq!(decode_connection_string(&urlsafe).unwrap()["tid"], "t-1");

        assert!(decode_connection_string("short").is_none());
        assert!(decode_connection_string("not-base64-at-all-!!!!!!!!").is_none());
    }

    #[test]
    fn test_status_classification() {
        let server = ApiError::from_status(StatusCode::SERVICE_UNAVAILABLE, "");
        assert_eq!(server.class(), FailureClass::Retryable);
        assert_eq!(server.status(), Some(503));

        let throttled = ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, "");
        assert_eq!(throttled.class(), FailureClass::Retryable);

        let rejected = ApiError::from_status(
            StatusCode::BAD_REQUEST,
            r#"{"success":false,"error":"Invalid request: Unknown product: p-9"}"#,
        );
        assert_eq!(rejected.class(), FailureClass::Permanent);
        assert_eq!(
            rejected.to_string(),
            "Invalid request: Unknown product: p-9 (HTTP 400)"
        );

        assert_eq!(
            ApiError::Connectivity("http://x".into()).class(),
            FailureClass::Connectivity
        );
        assert_eq!(
            ApiError::Timeout("http://x".into()).class(),
            FailureClass::Retryable
        );
    }

    #[test]
    fn test_error_message_keeps_plain_text_body() {
        let err = ApiError::from_status(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(err.to_string(), "Backend server error: upstream down (HTTP 502)");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://h", "/pos/orders"), "http://h/pos/orders");
        assert_eq!(join_url("http://h", "pos/orders"), "http://h/pos/orders");
    }
}
