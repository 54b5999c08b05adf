//! Environment and engine configuration
//!
//! Environment variables are loaded from the canonical location
//! `/etc/converge/environment` (or `$CONVERGE_ENV_FILE`, or `.env`) without
//! overriding variables that are already set. Engine settings are then read
//! with the `config` crate from an optional TOML file, with
//! `CONVERGE_`-prefixed environment overrides:
//!
//! ```toml
//! [api]
//! base_url = "https://compute.example.com/v1"
//!
//! [reconcile]
//! poll_interval_ms = 500
//! delete_confirm_attempts = 10
//! ```
//!
//! `CONVERGE_RECONCILE__OPERATION_TIMEOUT_SECS=600` overrides the matching key.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Alternative paths to check (in order of priority)
pub const ENV_FILE_PATHS: &[&str] = &["/etc/converge/environment", "/etc/converge.env", ".env"];

/// Prefix for environment overrides of [`EngineConfig`] keys
pub const ENV_PREFIX: &str = "CONVERGE";

/// Load environment variables from the canonical configuration file.
///
/// Returns the path that was loaded, or None if no file was found.
pub fn load_environment() -> Option<String> {
    if let Ok(custom_path) = std::env::var("CONVERGE_ENV_FILE") {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded_path) = try_load_env_file(path) {
            return Some(loaded_path);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

fn try_load_env_file(path: &str) -> Option<String> {
    if !Path::new(path).exists() {
        return None;
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read environment file {}: {}", path, e);
            return None;
        }
    };

    let (loaded, skipped) = apply_env_entries(parse_env_file(&content));
    info!(loaded, skipped, "Loaded environment from {}", path);
    Some(path.to_string())
}

/// Set each entry unless the variable already exists. Returns (loaded, skipped).
fn apply_env_entries(entries: Vec<(String, String)>) -> (usize, usize) {
    let mut loaded = 0;
    let mut skipped = 0;
    for (key, value) in entries {
        if std::env::var_os(&key).is_some() {
            debug!("Skipped (already set): {}", key);
            skipped += 1;
            continue;
        }
        let shown = if is_secret_key(&key) { "***" } else { value.as_str() };
        debug!("Loaded: {}={}", key, shown);
        std::env::set_var(&key, &value);
        loaded += 1;
    }
    (loaded, skipped)
}

fn is_secret_key(key: &str) -> bool {
    ["KEY", "TOKEN", "SECRET", "PASSWORD"]
        .iter()
        .any(|marker| key.contains(marker))
}

/// `KEY=VALUE` entries of an environment file; comments and blanks skipped.
fn parse_env_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_env_line)
        .collect()
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|q| value.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
        .unwrap_or(value);
    Some((key.to_string(), unquoted.to_string()))
}

/// Remote management API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Bearer token; usually supplied through `CONVERGE_API__TOKEN`
    pub token: Option<String>,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Page size requested from list endpoints; None uses the server default
    pub page_size: Option<u32>,
    /// Extra attempts for reads that failed transiently
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_string(),
            token: None,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            page_size: None,
            max_retries: 3,
            retry_backoff_ms: 250,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Polling and retry policy for operation execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// First delay between async job polls
    pub poll_interval_ms: u64,
    /// Upper bound the poll delay doubles towards
    pub poll_backoff_max_ms: u64,
    /// Total wait budget for one async job
    pub operation_timeout_secs: u64,
    /// Existence re-checks after a delete before giving up
    pub delete_confirm_attempts: u32,
    pub delete_confirm_backoff_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            poll_backoff_max_ms: 5_000,
            operation_timeout_secs: 20 * 60,
            delete_confirm_attempts: 10,
            delete_confirm_backoff_ms: 1_000,
        }
    }
}

impl ReconcileConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_backoff_max(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_max_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn delete_confirm_backoff(&self) -> Duration {
        Duration::from_millis(self.delete_confirm_backoff_ms)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api: ApiConfig,
    pub reconcile: ReconcileConfig,
}

impl EngineConfig {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading engine configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
