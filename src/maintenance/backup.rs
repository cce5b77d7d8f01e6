// src/maintenance/backup.rs
// Point-in-time backups via VACUUM INTO, verification, retention pruning

use crate::db::pool::ConnectionPool;
use crate::error::{KeepError, Result};
use crate::maintenance::integrity::verify_file;
use crate::utils::{
    file_timestamp, path_to_string, remove_if_exists, sidecar_paths, system_time_to_utc, with_suffix,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Prefix of scheduled/unnamed backups.
pub const BACKUP_PREFIX: &str = "oos_backup_";
/// Prefix of the safety copies Restore takes before overwriting the live file.
pub const PRE_RESTORE_PREFIX: &str = "pre_restore_backup_";
pub const BACKUP_EXTENSION: &str = "db";
/// Appended to a backup while it is being written and verified. Listing skips
/// these, so a backup only becomes restorable once it is complete.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// A backup file on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupRecord {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    pub(crate) fn from_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self {
            name,
            path: path.to_path_buf(),
            size_bytes: meta.len(),
            created_at: system_time_to_utc(meta.modified()?),
        })
    }
}

pub fn default_backup_name() -> String {
    format!("{BACKUP_PREFIX}{}.{BACKUP_EXTENSION}", file_timestamp(Utc::now()))
}

pub fn pre_restore_snapshot_name() -> String {
    format!(
        "{PRE_RESTORE_PREFIX}{}.{BACKUP_EXTENSION}",
        file_timestamp(Utc::now())
    )
}

/// Validate a caller-supplied backup name and add the `.db` extension if missing.
///
/// Names must be plain file names: no separators, no `..`, and not in the
/// namespace reserved for pre-restore snapshots.
pub fn normalize_backup_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(KeepError::InvalidInput("backup name is empty".to_string()));
    }
    let plain = Path::new(name)
        .file_name()
        .is_some_and(|file_name| file_name == name);
    if !plain || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(KeepError::InvalidInput(format!(
            "backup name '{name}' must be a plain file name"
        )));
    }
    if name.starts_with(PRE_RESTORE_PREFIX) {
        return Err(KeepError::InvalidInput(format!(
            "backup names starting with '{PRE_RESTORE_PREFIX}' are reserved"
        )));
    }

    let has_extension = Path::new(name)
        .extension()
        .is_some_and(|ext| ext == BACKUP_EXTENSION);
    Ok(if has_extension {
        name.to_string()
    } else {
        format!("{name}.{BACKUP_EXTENSION}")
    })
}

/// Delete a partial or unverifiable backup together with any sidecar files.
fn discard_backup_file(path: &Path) {
    for file in std::iter::once(path.to_path_buf()).chain(sidecar_paths(path)) {
        if let Err(e) = remove_if_exists(&file) {
            tracing::warn!("Could not remove {}: {}", file.display(), e);
        }
    }
}

/// Create a verified backup of the live database, then apply retention.
pub async fn create_backup(
    pool: &ConnectionPool,
    backup_dir: &Path,
    name: Option<&str>,
    retention: usize,
) -> Result<BackupRecord> {
    let name = match name {
        Some(name) => normalize_backup_name(name)?,
        None => default_backup_name(),
    };
    std::fs::create_dir_all(backup_dir)?;
    let path = backup_dir.join(&name);
    if path.exists() {
        return Err(KeepError::BackupFailed(format!(
            "backup {name} already exists"
        )));
    }

    let partial = with_suffix(&path, PARTIAL_SUFFIX);
    discard_backup_file(&partial);

    let conn = pool.acquire().await?;
    let target = path_to_string(&partial);
    let copied = conn
        .interact(move |conn| {
            conn.execute("VACUUM INTO ?1", [target])?;
            Ok(())
        })
        .await;
    drop(conn);

    if let Err(e) = copied {
        discard_backup_file(&partial);
        return Err(KeepError::BackupFailed(format!("copy to {name} failed: {e}")));
    }

    let verify_path = partial.clone();
    let verified = tokio::task::spawn_blocking(move || verify_file(&verify_path)).await?;
    if let Err(e) = verified {
        tracing::error!(backup = %name, "Backup failed verification, deleting it: {}", e);
        discard_backup_file(&partial);
        return Err(KeepError::BackupFailed(format!(
            "verification of {name} failed: {e}"
        )));
    }

    if path.exists() {
        discard_backup_file(&partial);
        return Err(KeepError::BackupFailed(format!(
            "backup {name} already exists"
        )));
    }
    if let Err(e) = std::fs::rename(&partial, &path) {
        discard_backup_file(&partial);
        return Err(KeepError::BackupFailed(format!(
            "could not move {name} into place: {e}"
        )));
    }
    // Sidecars left by verification belong to the partial name
    discard_backup_file(&partial);

    let record = BackupRecord::from_path(&path)?;
    tracing::info!(
        backup = %record.name,
        size_bytes = record.size_bytes,
        "Backup created"
    );

    match prune_backups(backup_dir, retention) {
        Ok(removed) if !removed.is_empty() => {
            tracing::info!(removed = removed.len(), retention, "Pruned old backups");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Backup retention pruning failed: {}", e),
    }

    Ok(record)
}

/// Files in `dir` (not recursive) with the backup extension whose name passes
/// `keep`, newest first. Ties on modification time are broken by name.
fn scan(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<BackupRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if !path.extension().is_some_and(|ext| ext == BACKUP_EXTENSION) {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !keep(&name) {
            continue;
        }
        match BackupRecord::from_path(path) {
            Ok(record) => records.push(record),
            // Raced with a concurrent prune
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(records)
}

/// Restorable backups, newest first. Pre-restore snapshots are not listed.
pub fn list_backups(backup_dir: &Path) -> Result<Vec<BackupRecord>> {
    scan(backup_dir, |name| !name.starts_with(PRE_RESTORE_PREFIX))
}

/// Pre-restore safety snapshots, newest first.
pub fn list_pre_restore_snapshots(backup_dir: &Path) -> Result<Vec<BackupRecord>> {
    scan(backup_dir, |name| name.starts_with(PRE_RESTORE_PREFIX))
}

fn prune(records: Vec<BackupRecord>, keep: usize) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for record in records.into_iter().skip(keep) {
        discard_backup_file(&record.path);
        if record.path.exists() {
            return Err(KeepError::Other(format!(
                "could not delete {}",
                record.path.display()
            )));
        }
        tracing::debug!(backup = %record.name, "Deleted backup past retention");
        removed.push(record.name);
    }
    Ok(removed)
}

/// Delete all but the newest `keep` backups. Returns the names removed.
pub fn prune_backups(backup_dir: &Path, keep: usize) -> Result<Vec<String>> {
    prune(list_backups(backup_dir)?, keep)
}

/// Delete all but the newest `keep` pre-restore snapshots.
pub fn prune_pre_restore_snapshots(backup_dir: &Path, keep: usize) -> Result<Vec<String>> {
    prune(list_pre_restore_snapshots(backup_dir)?, keep)
}

/// Delete backups left half-written by an interrupted run. Returns how many
/// files were removed.
pub fn remove_partial_backups(backup_dir: &Path) -> Result<usize> {
    if !backup_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in WalkDir::new(backup_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        // Covers `name.db.partial` and its `-wal`/`-shm` companions
        if entry.file_name().to_string_lossy().contains(PARTIAL_SUFFIX)
            && remove_if_exists(entry.path())?
        {
            tracing::info!(file = %entry.path().display(), "Removed partial backup");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Find a restorable backup by name.
pub fn find_backup(backup_dir: &Path, name: &str) -> Result<BackupRecord> {
    let name = normalize_backup_name(name)
        .map_err(|e| KeepError::RestoreFailed(e.to_string()))?;
    let path = backup_dir.join(&name);
    if !path.is_file() {
        return Err(KeepError::RestoreFailed(format!(
            "backup not found: {name}"
        )));
    }
    Ok(BackupRecord::from_path(&path)?)
}
