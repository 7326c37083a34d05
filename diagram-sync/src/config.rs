//! Server configuration.
//!
//! Defaults work out of the box for local development. In deployment every
//! field can be overridden through `DIAGRAM_SYNC_*` environment variables,
//! optionally loaded from a `.env` file first:
//!
//! | Variable                               | Default          |
//! |----------------------------------------|------------------|
//! | `DIAGRAM_SYNC_BIND_ADDR`               | `127.0.0.1:9090` |
//! | `DIAGRAM_SYNC_HEARTBEAT_INTERVAL_MS`   | `30000`          |
//! | `DIAGRAM_SYNC_SAVE_INTERVAL_MS`        | `30000`          |
//! | `DIAGRAM_SYNC_SAVE_TIMEOUT_MS`         | `10000`          |
//! | `DIAGRAM_SYNC_FINAL_FLUSH_TIMEOUT_MS`  | `10000`          |
//! | `DIAGRAM_SYNC_PRESENCE_TIMEOUT_MS`     | `30000`          |
//! | `DIAGRAM_SYNC_OUTBOUND_CAPACITY`       | `256`            |
//! | `DIAGRAM_SYNC_START_EMPTY_ON_LOAD_FAILURE` | `false`      |
//! | `DIAGRAM_SYNC_STORAGE_PATH`            | unset (memory)   |
//! | `DIAGRAM_SYNC_NAMESPACES`              | `nodes,edges`    |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::document::DEFAULT_NAMESPACES;
use crate::error::SyncError;

const ENV_PREFIX: &str = "DIAGRAM_SYNC_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// WebSocket ping interval; a missing pong by the next ping closes the socket
    pub heartbeat_interval_ms: u64,
    /// Periodic flush interval per room
    pub save_interval_ms: u64,
    /// Bound on each load or save call
    pub save_timeout_ms: u64,
    /// Bound on the final flush when a room empties
    pub final_flush_timeout_ms: u64,
    /// Presence entries not refreshed within this window are dropped
    pub presence_timeout_ms: u64,
    /// Outbound frames buffered per socket before it is dropped
    pub outbound_capacity: usize,
    /// Start rooms empty instead of refusing joins when the snapshot load fails
    pub start_empty_on_load_failure: bool,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Namespaces every document exports
    pub namespaces: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_ms: 30_000,
            save_interval_ms: 30_000,
            save_timeout_ms: 10_000,
            final_flush_timeout_ms: 10_000,
            presence_timeout_ms: 30_000,
            outbound_capacity: 256,
            start_empty_on_load_failure: false,
            storage_path: None,
            namespaces: DEFAULT_NAMESPACES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ServerConfig {
    /// Load from the environment, after applying `.env` if present.
    pub fn from_env() -> Result<Self, SyncError> {
        if let Ok(path) = dotenvy::dotenv() {
            log::debug!("Loaded environment from {}", path.display());
        }
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), SyncError> {
        let positive = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("save_interval_ms", self.save_interval_ms),
            ("save_timeout_ms", self.save_timeout_ms),
            ("final_flush_timeout_ms", self.final_flush_timeout_ms),
            ("presence_timeout_ms", self.presence_timeout_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(SyncError::Config(format!("{name} must be positive")));
        }
        if self.outbound_capacity == 0 {
            return Err(SyncError::Config("outbound_capacity must be positive".into()));
        }
        if self.namespaces.iter().all(|ns| ns.trim().is_empty()) {
            return Err(SyncError::Config("at least one namespace is required".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }

    pub fn final_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.final_flush_timeout_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    /// Configured namespaces, trimmed and without blanks.
    pub fn namespace_list(&self) -> Vec<String> {
        self.namespaces
            .iter()
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .collect()
    }

    /// Short intervals for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval_ms: 1_000,
            save_interval_ms: 200,
            save_timeout_ms: 1_000,
            final_flush_timeout_ms: 1_000,
            presence_timeout_ms: 30_000,
            outbound_capacity: 64,
            ..Self::default()
        }
    }
}
