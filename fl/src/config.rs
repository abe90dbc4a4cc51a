//! fleetctl configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use sharedstore::{MemoryStore, SharedStore, SqliteStore, SqliteStoreConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::bus::BusConfig;
use crate::elevation::ElevationConfig;
use crate::lock::LockConfig;
use crate::pubsub::PubSubConfig;
use crate::rollback::RollbackConfig;

/// Main fleetctl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared store backend
    pub store: StoreConfig,

    /// Lock profiles
    pub lock: LockConfig,

    /// Message bus tuning
    pub bus: BusConfig,

    /// Pub/sub poll loop tuning
    pub pubsub: PubSubConfig,

    /// Elevation policy
    pub elevation: ElevationConfig,

    /// Rollback record retention
    pub rollback: RollbackConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .fleetctl.yml
        let local_config = PathBuf::from(".fleetctl.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/fleetctl/fleetctl.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("fleetctl").join("fleetctl.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Which shared store implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process only; state is lost on exit
    Memory,
    /// SQLite file shared by every process on the host
    Sqlite,
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Database file for the sqlite backend
    pub path: PathBuf,

    /// Write lock wait in milliseconds
    #[serde(rename = "busy-timeout-ms")]
    pub busy_timeout_ms: u64,

    /// Poll interval for blocking reads and subscribers in milliseconds
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        debug!("StoreConfig::default: called");
        let path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fleetctl")
            .join("fleetctl.db");
        Self {
            backend: StoreBackend::Sqlite,
            path,
            busy_timeout_ms: 5000,
            poll_interval_ms: 25,
        }
    }
}

impl StoreConfig {
    /// Open the configured backend
    pub fn open(&self) -> Result<Arc<dyn SharedStore>> {
        debug!(backend = ?self.backend, path = %self.path.display(), "StoreConfig::open: called");
        match self.backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreBackend::Sqlite => {
                if let Some(parent) = self.path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    fs::create_dir_all(parent)
                        .context(format!("Failed to create store directory {}", parent.display()))?;
                }
                let mut config = SqliteStoreConfig::new(&self.path);
                config.busy_timeout = Duration::from_millis(self.busy_timeout_ms);
                config.poll_interval = Duration::from_millis(self.poll_interval_ms);
                let store = SqliteStore::with_config(config)
                    .context(format!("Failed to open store at {}", self.path.display()))?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::PermissionLevel;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert!(config.store.path.ends_with("fleetctl/fleetctl.db"));
        assert_eq!(config.bus.request_timeout_secs, 30);
        assert_eq!(config.elevation.rate_limit_per_hour, 10);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
store:
  backend: memory
bus:
  request-timeout-secs: 5
elevation:
  ceiling: 2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.poll_interval_ms, 25);
        assert_eq!(config.bus.request_timeout_secs, 5);
        assert_eq!(config.bus.block_ms, 1000);
        assert_eq!(config.elevation.ceiling, PermissionLevel::ELEVATED);
        assert_eq!(config.lock.task.max_retries, 3);
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleet.yml");
        fs::write(&path, "store:\n  backend: memory\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);

        let missing = dir.path().join("missing.yml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[tokio::test]
    async fn test_open_sqlite_creates_parent() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            path: dir.path().join("nested").join("fleet.db"),
            ..StoreConfig::default()
        };
        let store = config.open().unwrap();
        store.ping().await.unwrap();
        assert!(config.path.exists());
    }
}
