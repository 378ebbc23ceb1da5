//! Client and server configuration.

use serde_json::Value;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::api::{decode_connection_string, normalize_base_url};
use crate::storage::{self, KeyValueStore};

/// Default drain interval while online with a non-empty queue.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default timeout for API requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity probe.
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval of the connectivity polling fallback.
pub const CONNECTIVITY_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_TAX_RATE: f64 = 0.10;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub terminal_id: Option<String>,
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("terminal_id", &self.terminal_id)
            .field("sync_interval", &self.sync_interval)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            terminal_id: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Build a config from an onboarding connection string.
    pub fn from_connection_string(raw: &str) -> Result<Self, String> {
        let payload = decode_connection_string(raw).ok_or("Unrecognised connection string")?;
        let field = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let url = field("url").ok_or("Connection string is missing url")?;
        let key = field("key").ok_or("Connection string is missing key")?;
        let mut config = Self::new(&url, &key);
        config.terminal_id = field("tid").or_else(|| field("terminalId"));
        Ok(config)
    }

    /// Load from a credential store (the OS keyring in production).
    pub fn from_credentials(store: &dyn KeyValueStore) -> Result<Self, String> {
        let read = |key: &str| -> Result<Option<String>, String> {
            Ok(store
                .get(key)?
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()))
        };
        let url = read(storage::KEY_BACKEND_URL)?
            .ok_or("Client not configured: missing backend URL")?;
        let key = read(storage::KEY_API_KEY)?.ok_or("Client not configured: missing API key")?;
        let mut config = Self::new(&url, &key);
        config.terminal_id = read(storage::KEY_TERMINAL_ID)?;
        Ok(config)
    }

    /// Persist URL, API key and terminal id to a credential store.
    pub fn save_credentials(&self, store: &dyn KeyValueStore) -> Result<(), String> {
        store.set(storage::KEY_BACKEND_URL, &self.base_url)?;
        store.set(storage::KEY_API_KEY, &self.api_key)?;
        match self.terminal_id.as_deref() {
            Some(tid) => store.set(storage::KEY_TERMINAL_ID, tid)?,
            None => store.remove(storage::KEY_TERMINAL_ID)?,
        }
        info!(base_url = %self.base_url, "backend credentials updated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub tax_rate: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_path: PathBuf::from("pos-server.db"),
            tax_rate: DEFAULT_TAX_RATE,
        }
    }
}

impl ServerConfig {
    /// Reads `POS_BIND_ADDR`, `POS_DATABASE_PATH` and `POS_TAX_RATE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = non_empty_var("POS_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = non_empty_var("POS_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(raw) = non_empty_var("POS_TAX_RATE") {
            let rate: f64 = raw
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("POS_TAX_RATE is not a number: {raw}")))?;
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!(
                    "POS_TAX_RATE must be between 0 and 1, got {rate}"
                )));
            }
            config.tax_rate = rate;
        }

        Ok(config)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
