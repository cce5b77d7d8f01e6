// src/db/settings.rs
// Durability/performance PRAGMAs applied to every pooled connection

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

const JOURNAL_MODES: [&str; 6] = ["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];
const SYNCHRONOUS_LEVELS: [&str; 4] = ["OFF", "NORMAL", "FULL", "EXTRA"];

/// Connection settings applied at creation time.
///
/// Defaults trade a little durability for throughput: WAL with
/// `synchronous=NORMAL` only fsyncs on checkpoints, and a crash can lose at
/// most the last committed transaction, never corrupt the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilitySettings {
    pub journal_mode: String,
    pub synchronous: String,
    /// Negative = KiB, positive = pages (SQLite semantics)
    pub cache_size: i64,
    /// Long enough to ride out a checkpoint stall on a busy writer
    pub busy_timeout_ms: u64,
    pub foreign_keys: bool,
    pub mmap_size: i64,
    pub wal_autocheckpoint: i64,
}

impl Default for DurabilitySettings {
    fn default() -> Self {
        Self {
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size: -64_000,
            busy_timeout_ms: 30_000,
            foreign_keys: true,
            mmap_size: 268_435_456,
            wal_autocheckpoint: 1000,
        }
    }
}

impl DurabilitySettings {
    /// Reject values that would be interpolated into PRAGMA text unchecked.
    pub fn validate(&self) -> Result<(), String> {
        let journal = self.journal_mode.to_uppercase();
        if !JOURNAL_MODES.contains(&journal.as_str()) {
            return Err(format!("unknown journal_mode '{}'", self.journal_mode));
        }
        let sync = self.synchronous.to_uppercase();
        if !SYNCHRONOUS_LEVELS.contains(&sync.as_str()) {
            return Err(format!("unknown synchronous level '{}'", self.synchronous));
        }
        if self.mmap_size < 0 {
            return Err("mmap_size must not be negative".to_string());
        }
        if self.wal_autocheckpoint < 0 {
            return Err("wal_autocheckpoint must not be negative".to_string());
        }
        Ok(())
    }

    /// Numeric value `PRAGMA synchronous` reports for the configured level.
    pub fn expected_synchronous(&self) -> Option<i64> {
        SYNCHRONOUS_LEVELS
            .iter()
            .position(|level| level.eq_ignore_ascii_case(&self.synchronous))
            .map(|pos| pos as i64)
    }
}

/// Name of a numeric `PRAGMA synchronous` level.
pub fn synchronous_name(level: i64) -> String {
    usize::try_from(level)
        .ok()
        .and_then(|idx| SYNCHRONOUS_LEVELS.get(idx))
        .map(|name| (*name).to_string())
        .unwrap_or_else(|| level.to_string())
}

/// A setting that could not be applied. The connection stays usable with the
/// SQLite default for that setting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingWarning {
    pub setting: &'static str,
    pub message: String,
}

impl std::fmt::Display for SettingWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.setting, self.message)
    }
}

/// Apply every durability setting to a fresh connection, in order.
///
/// Never fails: each setting is applied independently, and failures are logged
/// and returned so the caller can surface them.
pub fn apply_settings(conn: &Connection, settings: &DurabilitySettings) -> Vec<SettingWarning> {
    let mut warnings = Vec::new();

    // journal_mode reports the mode actually in effect; in-memory databases
    // answer "memory" no matter what was asked for.
    let requested = settings.journal_mode.to_uppercase();
    match conn.query_row(&format!("PRAGMA journal_mode={requested}"), [], |row| {
        row.get::<_, String>(0)
    }) {
        Ok(mode) if mode.eq_ignore_ascii_case(&requested) => {}
        Ok(mode) => warnings.push(SettingWarning {
            setting: "journal_mode",
            message: format!("requested {requested}, database reports {mode}"),
        }),
        Err(e) => warnings.push(SettingWarning {
            setting: "journal_mode",
            message: e.to_string(),
        }),
    }

    let statements: [(&'static str, String); 6] = [
        (
            "synchronous",
            format!("PRAGMA synchronous={}", settings.synchronous.to_uppercase()),
        ),
        ("cache_size", format!("PRAGMA cache_size={}", settings.cache_size)),
        (
            "busy_timeout",
            format!("PRAGMA busy_timeout={}", settings.busy_timeout_ms),
        ),
        (
            "foreign_keys",
            format!(
                "PRAGMA foreign_keys={}",
                if settings.foreign_keys { "ON" } else { "OFF" }
            ),
        ),
        ("mmap_size", format!("PRAGMA mmap_size={}", settings.mmap_size)),
        (
            "wal_autocheckpoint",
            format!("PRAGMA wal_autocheckpoint={}", settings.wal_autocheckpoint),
        ),
    ];

    for (setting, sql) in statements {
        if let Err(e) = conn.execute_batch(&sql) {
            warnings.push(SettingWarning {
                setting,
                message: e.to_string(),
            });
        }
    }

    for warning in &warnings {
        tracing::warn!(setting = warning.setting, "Connection setting not applied: {}", warning.message);
    }

    warnings
}
