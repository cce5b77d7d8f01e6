// src/config/file.rs
// File-based configuration from ~/.keepsafe/config.toml

use crate::db::health_log::DEFAULT_LOG_CAP;
use crate::db::pool::PoolConfig;
use crate::db::settings::DurabilitySettings;
use crate::maintenance::vacuum::DEFAULT_FRAGMENTATION_THRESHOLD;
use crate::error::{KeepError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Everything the manager needs, passed explicitly to `Manager::open`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Live database file
    pub db_path: PathBuf,
    /// Backup directory; defaults to `backups/` next to the database
    pub backup_dir: Option<PathBuf>,
    pub max_connections: usize,
    pub acquire_timeout_secs: u64,
    pub backup_interval_secs: u64,
    /// Shorter than the interval: a missed backup costs more than a missed check
    pub backup_retry_secs: u64,
    pub integrity_interval_secs: u64,
    pub integrity_retry_secs: u64,
    /// Backups (and separately, pre-restore snapshots) kept
    pub retention_count: usize,
    /// Fragmentation percentage at which VACUUM runs
    pub fragmentation_threshold: f64,
    pub health_log_cap: usize,
    pub shutdown_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub settings: DurabilitySettings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("keepsafe.db"),
            backup_dir: None,
            max_connections: 10,
            acquire_timeout_secs: 30,
            backup_interval_secs: 6 * 60 * 60,
            backup_retry_secs: 30 * 60,
            integrity_interval_secs: 24 * 60 * 60,
            integrity_retry_secs: 60 * 60,
            retention_count: 10,
            fragmentation_threshold: DEFAULT_FRAGMENTATION_THRESHOLD,
            health_log_cap: DEFAULT_LOG_CAP,
            shutdown_timeout_secs: 10,
            drain_timeout_secs: 5,
            settings: DurabilitySettings::default(),
        }
    }
}

/// ~/.keepsafe, or ./.keepsafe without a home directory
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".keepsafe")
}

impl ManagerConfig {
    /// Config for a database at `db_path` with everything else defaulted.
    pub fn for_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Load config from an explicit file, or from ~/.keepsafe/config.toml.
    ///
    /// An explicit file must exist and parse. The default file is optional and
    /// a broken one falls back to defaults with a warning.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                KeepError::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            let config = Self::parse(&contents)
                .map_err(|e| KeepError::Config(format!("{}: {e}", path.display())))?;
            debug!(path = %path.display(), "Loaded config from file");
            return Ok(config);
        }

        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config from file");
                    Ok(config)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Ok(Self::default())
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn parse(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        data_dir().join("config.toml")
    }

    pub fn backup_dir(&self) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => dir.clone(),
            None => self
                .db_path
                .parent()
                .map(|p| p.join("backups"))
                .unwrap_or_else(|| PathBuf::from("backups")),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            path: self.db_path.clone(),
            max_connections: self.max_connections,
            acquire_timeout: self.acquire_timeout(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }

    pub fn backup_retry_delay(&self) -> Duration {
        Duration::from_secs(self.backup_retry_secs)
    }

    pub fn integrity_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_interval_secs)
    }

    pub fn integrity_retry_delay(&self) -> Duration {
        Duration::from_secs(self.integrity_retry_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
