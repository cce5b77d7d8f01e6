//! src/utils.rs
//! Shared utility functions used across the codebase

use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Extension trait for Result to simplify error conversion to String.
///
/// Use `.str_err()?` instead of `.map_err(|e| e.to_string())?`.
pub trait ResultExt<T, E> {
    /// Convert the error type to String.
    fn str_err(self) -> Result<T, String>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    fn str_err(self) -> Result<T, String> {
        self.map_err(|e| e.to_string())
    }
}

/// Convert a Path to an owned String, replacing invalid UTF-8 with U+FFFD.
pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Timestamp used in generated file names: `YYYYmmdd_HHMMSS_micros`.
///
/// Sorts lexically in chronological order.
pub fn file_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S_%6f").to_string()
}

/// `path` with `suffix` appended to the file name (`live.db` -> `live.db-wal`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// WAL and shared-memory companions of a database file.
pub fn sidecar_paths(path: &Path) -> [PathBuf; 2] {
    [with_suffix(path, "-wal"), with_suffix(path, "-shm")]
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
