//! Configuration for elohim-custodian

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::ClientConfig;
use crate::error::{CustodyError, Result};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("elohim-custodian")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the key vault
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Address the WebSocket daemon listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Built-in allowlist. Callers from these origins are always admitted
    /// and the entries cannot be removed at runtime.
    #[serde(default = "default_origins")]
    pub default_origins: Vec<String>,

    /// Deadline for general calls
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Deadline for the liveness probe issued while connecting
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Pause before the single probe retry
    #[serde(default = "default_probe_backoff_ms")]
    pub probe_backoff_ms: u64,

    /// How long to wait for the custodian context to signal it has loaded
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8787))
}

fn default_origins() -> Vec<String> {
    vec![
        "http://localhost:4200".to_string(),
        "https://elohim.host".to_string(),
    ]
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_probe_backoff_ms() -> u64 {
    1_000
}

fn default_load_timeout_ms() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            listen: default_listen(),
            default_origins: default_origins(),
            request_timeout_ms: default_request_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_backoff_ms: default_probe_backoff_ms(),
            load_timeout_ms: default_load_timeout_ms(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CustodyError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| CustodyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get vault directory
    pub fn vault_dir(&self) -> PathBuf {
        self.storage_dir.join("vault")
    }

    /// Timeouts for a client stub built from this config.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            probe_backoff: Duration::from_millis(self.probe_backoff_ms),
            load_timeout: Duration::from_millis(self.load_timeout_ms),
        }
    }
}
