//! Hub configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HubError, Result};

/// Main hub configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// Address the WebSocket listener binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Upgrade path clusters must request
    #[serde(default = "default_path")]
    pub path: String,

    /// Liveness timeout; a cluster missing one interval is evicted
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Heartbeat cadence advertised to clusters in the Identify frame
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Path to the static user table (JSON)
    #[serde(default = "default_users_path")]
    pub users_path: PathBuf,

    /// Path to the metric-shard schema document (JSON)
    #[serde(default = "default_schema_path")]
    pub schema_path: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Record store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding the append-only record files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_path() -> String {
    "/manager".to_string()
}

fn default_heartbeat_timeout() -> u64 {
    45_000
}

fn default_heartbeat_interval() -> u64 {
    15_000
}

fn default_users_path() -> PathBuf {
    PathBuf::from("./config/users.json")
}

fn default_schema_path() -> PathBuf {
    PathBuf::from("./config/schema.json")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            path: default_path(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            users_path: default_users_path(),
            schema_path: default_schema_path(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl HubConfig {
    /// Load the configuration from a TOML file, writing out the defaults
    /// if the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| HubError::Config(format!("{}: {}", path.display(), e)))
        } else {
            let config = Self::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let raw = toml::to_string_pretty(&config)
                .map_err(|e| HubError::Config(e.to_string()))?;
            std::fs::write(path, raw)?;
            Ok(config)
        }
    }

    /// Get the heartbeat timeout as a Duration.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}
