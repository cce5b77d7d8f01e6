// src/config/env.rs
// Environment overrides and configuration validation

use super::file::ManagerConfig;
use crate::error::{KeepError, Result};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Values read from KEEPSAFE_* environment variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    /// KEEPSAFE_DB_PATH
    pub db_path: Option<PathBuf>,
    /// KEEPSAFE_BACKUP_DIR
    pub backup_dir: Option<PathBuf>,
    /// KEEPSAFE_MAX_CONNECTIONS
    pub max_connections: Option<usize>,
    /// KEEPSAFE_ACQUIRE_TIMEOUT_SECS
    pub acquire_timeout_secs: Option<u64>,
    /// KEEPSAFE_RETENTION_COUNT
    pub retention_count: Option<usize>,
    /// KEEPSAFE_FRAGMENTATION_THRESHOLD
    pub fragmentation_threshold: Option<f64>,
}

impl EnvOverrides {
    /// Read overrides from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read overrides through `lookup`; unparseable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            db_path: read("KEEPSAFE_DB_PATH").map(PathBuf::from),
            backup_dir: read("KEEPSAFE_BACKUP_DIR").map(PathBuf::from),
            max_connections: parse_env(&read, "KEEPSAFE_MAX_CONNECTIONS"),
            acquire_timeout_secs: parse_env(&read, "KEEPSAFE_ACQUIRE_TIMEOUT_SECS"),
            retention_count: parse_env(&read, "KEEPSAFE_RETENTION_COUNT"),
            fragmentation_threshold: parse_env(&read, "KEEPSAFE_FRAGMENTATION_THRESHOLD"),
        }
    }

    pub fn apply(&self, config: &mut ManagerConfig) {
        if let Some(path) = &self.db_path {
            debug!(path = %path.display(), "Database path from environment");
            config.db_path = path.clone();
        }
        if let Some(dir) = &self.backup_dir {
            config.backup_dir = Some(dir.clone());
        }
        if let Some(n) = self.max_connections {
            config.max_connections = n;
        }
        if let Some(secs) = self.acquire_timeout_secs {
            config.acquire_timeout_secs = secs;
        }
        if let Some(n) = self.retention_count {
            config.retention_count = n;
        }
        if let Some(threshold) = self.fragmentation_threshold {
            config.fragmentation_threshold = threshold;
        }
    }
}

fn parse_env<T: std::str::FromStr>(read: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = read(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}: cannot parse '{}'", name, raw);
            None
        }
    }
}

/// Configuration validation result
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Log warnings, turn errors into `KeepError::Config`.
    pub fn into_result(self) -> Result<()> {
        for warning in &self.warnings {
            warn!("Config: {}", warning);
        }
        if self.is_valid() {
            Ok(())
        } else {
            Err(KeepError::Config(self.errors.join("; ")))
        }
    }
}

impl ManagerConfig {
    /// Apply KEEPSAFE_* overrides from the process environment
    pub fn apply_env(&mut self) {
        EnvOverrides::from_env().apply(self);
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if self.db_path.as_os_str().is_empty() {
            validation.add_error("db_path must not be empty");
        }
        if self.max_connections == 0 {
            validation.add_error("max_connections must be at least 1");
        }
        if self.retention_count == 0 {
            validation.add_error("retention_count must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.fragmentation_threshold) {
            validation.add_error(format!(
                "fragmentation_threshold {} is outside 0..=100",
                self.fragmentation_threshold
            ));
        }
        if self.health_log_cap == 0 {
            validation.add_error("health_log_cap must be at least 1");
        }
        if let Err(e) = self.settings.validate() {
            validation.add_error(format!("settings: {e}"));
        }

        if self.acquire_timeout_secs == 0 {
            validation.add_warning("acquire_timeout_secs is 0; acquires fail unless a connection is idle");
        }
        if self.backup_retry_secs > self.backup_interval_secs {
            validation.add_warning("backup_retry_secs is longer than backup_interval_secs");
        }
        if self.integrity_retry_secs > self.integrity_interval_secs {
            validation.add_warning("integrity_retry_secs is longer than integrity_interval_secs");
        }

        validation
    }
}
