use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::TaskId;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_STREAM_BASE_URL: &str = "ws://localhost:8080/api/ws";
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3_000;

/// Top-level console client configuration (`opman.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            timeout_secs: default_api_timeout_secs(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for the real-time task log socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_base_url")]
    pub base_url: String,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_stream_base_url(),
            auto_reconnect: default_auto_reconnect(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl StreamConfig {
    /// Endpoint of the log channel for one task.
    pub fn task_url(&self, task_id: TaskId) -> String {
        task_url(&self.base_url, task_id)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

pub fn task_url(base_url: &str, task_id: TaskId) -> String {
    format!("{}/tasks/{}", base_url.trim_end_matches('/'), task_id)
}

pub fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

pub fn default_api_timeout_secs() -> u64 {
    DEFAULT_API_TIMEOUT_SECS
}

pub fn default_stream_base_url() -> String {
    DEFAULT_STREAM_BASE_URL.to_string()
}

pub fn default_auto_reconnect() -> bool {
    true
}

pub fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}

impl ConsoleConfig {
    /// Load from an optional TOML file, then apply `OPMAN_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                debug!("config file {} not found, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Overlay values from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OPMAN_API_URL") {
            self.api.base_url = url;
        }
        if let Some(raw) = lookup("OPMAN_API_TIMEOUT_SECS") {
            match raw.trim().parse() {
                Ok(secs) => self.api.timeout_secs = secs,
                Err(_) => warn!("ignoring invalid OPMAN_API_TIMEOUT_SECS '{}'", raw),
            }
        }
        if let Some(url) = lookup("OPMAN_WS_URL") {
            self.stream.base_url = url;
        }
        if let Some(raw) = lookup("OPMAN_WS_RECONNECT") {
            match parse_flag(&raw) {
                Some(flag) => self.stream.auto_reconnect = flag,
                None => warn!("ignoring invalid OPMAN_WS_RECONNECT '{}'", raw),
            }
        }
        if let Some(raw) = lookup("OPMAN_WS_RECONNECT_MS") {
            match raw.trim().parse() {
                Ok(ms) => self.stream.reconnect_interval_ms = ms,
                Err(_) => warn!("ignoring invalid OPMAN_WS_RECONNECT_MS '{}'", raw),
            }
        }
        if let Some(token) = lookup("OPMAN_TOKEN") {
            let token = token.trim();
            if !token.is_empty() {
                self.token = Some(token.to_string());
            }
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
