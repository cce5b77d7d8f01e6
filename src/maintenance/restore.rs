// src/maintenance/restore.rs
// Restore engine: suspend pool, snapshot, install backup, reopen, re-verify

use crate::db::pool::{ConnectionPool, PoolConfig};
use crate::db::schema::{ensure_schema, system_info_set};
use crate::db::settings::DurabilitySettings;
use crate::error::{KeepError, Result};
use crate::maintenance::backup::{
    BackupRecord, find_backup, pre_restore_snapshot_name, prune_pre_restore_snapshots,
};
use crate::maintenance::integrity::{IntegrityResult, check_integrity, verify_file};
use crate::utils::{remove_if_exists, sidecar_paths, with_suffix};
use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;

/// What a restore needs from its owner.
pub struct RestoreContext<'a> {
    /// The live pool; the write lock is held for the close/swap/reopen phase
    pub pool: &'a RwLock<ConnectionPool>,
    pub backup_dir: &'a Path,
    /// Pre-restore snapshots kept after a successful restore
    pub retention: usize,
    /// How long checked-out connections get to come back
    pub drain_timeout: Duration,
    pub log_cap: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup: BackupRecord,
    /// Absent when there was no live file to snapshot
    pub pre_restore_snapshot: Option<BackupRecord>,
    pub integrity: IntegrityResult,
}

/// Restore the live database from the named backup.
///
/// The backup must exist and pass its own integrity check before anything is
/// touched. On success the restored database has also passed a full check.
pub async fn restore_backup(ctx: RestoreContext<'_>, name: &str) -> Result<RestoreReport> {
    let backup = find_backup(ctx.backup_dir, name)?;

    let verify_path = backup.path.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || verify_file(&verify_path)).await? {
        return Err(KeepError::RestoreFailed(format!(
            "backup {} failed verification: {e}",
            backup.name
        )));
    }

    tracing::warn!(backup = %backup.name, "Restoring database from backup");

    let mut pool = ctx.pool.write().await;
    let config = pool.config().clone();
    let settings = pool.settings().clone();

    // Copied before any connection closes: closing the last one checkpoints
    // the WAL into the main file.
    let live = config.path.clone();
    let backup_dir = ctx.backup_dir.to_path_buf();
    let snapshot = tokio::task::spawn_blocking(move || take_snapshot(&live, &backup_dir))
        .await?
        .map_err(|e| {
            tracing::error!("Restore aborted, could not snapshot the live file: {}", e);
            KeepError::RestoreFailed(format!("pre-restore snapshot failed: {e}"))
        })?;

    pool.close_all();

    if !pool.wait_drained(ctx.drain_timeout).await {
        let still_out = pool.stats().active;
        if let Some(snapshot) = &snapshot {
            discard_snapshot(&snapshot.path);
        }
        *pool = ConnectionPool::open(config, settings).await?;
        return Err(KeepError::RestoreFailed(format!(
            "{still_out} connection(s) still checked out after {:?}",
            ctx.drain_timeout
        )));
    }

    let source = backup.path.clone();
    let target = config.path.clone();
    let installed = tokio::task::spawn_blocking(move || install(&target, &source)).await?;
    if let Err(e) = installed {
        tracing::error!("Restore aborted before the live file changed: {}", e);
        *pool = ConnectionPool::open(config, settings).await?;
        return Err(KeepError::RestoreFailed(e.to_string()));
    }

    let reopened = reopen(config, settings.clone(), &backup.name)
        .await
        .map_err(|e| {
            tracing::error!("Restored file is in place but the pool could not reopen: {}", e);
            KeepError::RestoreFailed(format!("could not reopen restored database: {e}"))
        })?;
    *pool = reopened.clone();
    drop(pool);

    let integrity = check_integrity(&reopened, &settings, ctx.log_cap).await;
    if !integrity.is_healthy() {
        tracing::error!(
            backup = %backup.name,
            errors = ?integrity.errors,
            "Restored database failed its integrity check"
        );
        return Err(KeepError::RestoreFailed(format!(
            "restored database is {}: {}",
            integrity.status.as_str(),
            integrity.errors.join("; ")
        )));
    }

    match prune_pre_restore_snapshots(ctx.backup_dir, ctx.retention) {
        Ok(removed) if !removed.is_empty() => {
            tracing::info!(removed = removed.len(), "Pruned old pre-restore snapshots");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Pre-restore snapshot pruning failed: {}", e),
    }

    tracing::info!(
        backup = %backup.name,
        snapshot = snapshot.as_ref().map(|s| s.name.as_str()).unwrap_or("none"),
        "Database restored"
    );

    Ok(RestoreReport {
        backup,
        pre_restore_snapshot: snapshot,
        integrity,
    })
}

/// Copy the live file and its WAL aside, exactly as found. Blocking.
///
/// `None` when there is no live file yet.
fn take_snapshot(live: &Path, backup_dir: &Path) -> Result<Option<BackupRecord>> {
    if !live.exists() {
        return Ok(None);
    }
    std::fs::create_dir_all(backup_dir)?;
    let snapshot_path = backup_dir.join(pre_restore_snapshot_name());
    let copied = std::fs::copy(live, &snapshot_path).and_then(|_| {
        let [live_wal, _] = sidecar_paths(live);
        if live_wal.exists() {
            std::fs::copy(&live_wal, with_suffix(&snapshot_path, "-wal"))?;
        }
        Ok(())
    });
    if let Err(e) = copied {
        discard_snapshot(&snapshot_path);
        return Err(e.into());
    }
    tracing::info!(snapshot = %snapshot_path.display(), "Pre-restore snapshot taken");
    Ok(Some(BackupRecord::from_path(&snapshot_path)?))
}

fn discard_snapshot(path: &Path) {
    for file in std::iter::once(path.to_path_buf()).chain(sidecar_paths(path)) {
        if let Err(e) = remove_if_exists(&file) {
            tracing::warn!("Could not remove {}: {}", file.display(), e);
        }
    }
}

/// Swap the backup in through a staging copy. Blocking.
///
/// Any error returned here leaves the live file as it was.
fn install(live: &Path, backup: &Path) -> Result<()> {
    let staging = with_suffix(live, ".restore-tmp");
    if let Err(e) = std::fs::copy(backup, &staging) {
        let _ = remove_if_exists(&staging);
        return Err(e.into());
    }

    // A stale WAL would be replayed into the restored file.
    for sidecar in sidecar_paths(live) {
        remove_if_exists(&sidecar)?;
    }
    if let Err(e) = std::fs::rename(&staging, live) {
        let _ = remove_if_exists(&staging);
        return Err(e.into());
    }
    Ok(())
}

async fn reopen(config: PoolConfig, settings: DurabilitySettings, backup_name: &str) -> Result<ConnectionPool> {
    let pool = ConnectionPool::open(config, settings).await?;
    let conn = pool.acquire().await?;
    let backup_name = backup_name.to_string();
    conn.interact(move |conn| {
        ensure_schema(conn)?;
        system_info_set(conn, "last_restore", &backup_name)?;
        system_info_set(conn, "last_restore_at", &Utc::now().to_rfc3339())?;
        Ok(())
    })
    .await?;
    drop(conn);
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::system_info_get;
    use crate::maintenance::backup::{create_backup, list_pre_restore_snapshots};
    use std::path::PathBuf;

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: RwLock<ConnectionPool>,
        backup_dir: PathBuf,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let pool = ConnectionPool::open(
                PoolConfig {
                    path: dir.path().join("live.db"),
                    max_connections: 2,
                    acquire_timeout: Duration::from_secs(5),
                },
                DurabilitySettings::default(),
            )
            .await
            .unwrap();
            let conn = pool.acquire().await.unwrap();
            conn.interact(|conn| {
                ensure_schema(conn)?;
                conn.execute_batch(
                    "CREATE TABLE items(id INTEGER PRIMARY KEY, name TEXT);
                     INSERT INTO items(name) VALUES ('one'), ('two');",
                )?;
                Ok(())
            })
            .await
            .unwrap();
            drop(conn);

            Self {
                backup_dir: dir.path().join("backups"),
                pool: RwLock::new(pool),
                _dir: dir,
            }
        }

        fn ctx(&self, drain_timeout: Duration) -> RestoreContext<'_> {
            RestoreContext {
                pool: &self.pool,
                backup_dir: &self.backup_dir,
                retention: 10,
                drain_timeout,
                log_cap: 100,
            }
        }

        async fn item_count(&self) -> i64 {
            let pool = self.pool.read().await.clone();
            let conn = pool.acquire().await.unwrap();
            conn.interact(|conn| {
                conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
                    .map_err(Into::into)
            })
            .await
            .unwrap()
        }

        async fn exec(&self, sql: &'static str) {
            let pool = self.pool.read().await.clone();
            let conn = pool.acquire().await.unwrap();
            conn.interact(move |conn| conn.execute_batch(sql).map_err(Into::into))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let fx = Fixture::new().await;
        let pool = fx.pool.read().await.clone();
        create_backup(&pool, &fx.backup_dir, Some("before"), 10)
            .await
            .unwrap();
        drop(pool);

        fx.exec("INSERT INTO items(name) VALUES ('three'); DELETE FROM items WHERE name = 'one';")
            .await;

        let report = restore_backup(fx.ctx(Duration::from_secs(2)), "before")
            .await
            .unwrap();

        assert_eq!(report.backup.name, "before.db");
        assert!(report.integrity.is_healthy());
        assert_eq!(fx.item_count().await, 2);

        let snapshot = report.pre_restore_snapshot.unwrap();
        let snap = rusqlite::Connection::open(&snapshot.path).unwrap();
        let snap_count: i64 = snap
            .query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(snap_count, 2);
        let has_three: i64 = snap
            .query_row("SELECT COUNT(*) FROM items WHERE name = 'three'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(has_three, 1);

        let pool = fx.pool.read().await.clone();
        let conn = pool.acquire().await.unwrap();
        let last = conn
            .interact(|conn| system_info_get(conn, "last_restore"))
            .await
            .unwrap();
        assert_eq!(last.as_deref(), Some("before.db"));
    }

    #[tokio::test]
    async fn test_snapshot_keeps_the_file_as_found() {
        let fx = Fixture::new().await;
        let pool = fx.pool.read().await.clone();
        create_backup(&pool, &fx.backup_dir, Some("before"), 10)
            .await
            .unwrap();
        drop(pool);
        fx.exec("INSERT INTO items(name) VALUES ('only in the wal');").await;

        let live = fx.pool.read().await.path().to_path_buf();
        let main_before = std::fs::read(&live).unwrap();
        let wal_before = std::fs::read(with_suffix(&live, "-wal")).unwrap();
        assert!(!wal_before.is_empty());

        let report = restore_backup(fx.ctx(Duration::from_secs(2)), "before")
            .await
            .unwrap();

        let snapshot = report.pre_restore_snapshot.unwrap();
        assert_eq!(std::fs::read(&snapshot.path).unwrap(), main_before);
        assert_eq!(
            std::fs::read(with_suffix(&snapshot.path, "-wal")).unwrap(),
            wal_before
        );
    }

    #[tokio::test]
    async fn test_empty_backup_is_refused() {
        let fx = Fixture::new().await;
        std::fs::create_dir_all(&fx.backup_dir).unwrap();
        std::fs::write(fx.backup_dir.join("empty.db"), b"").unwrap();

        let result = restore_backup(fx.ctx(Duration::from_secs(1)), "empty").await;

        assert!(matches!(result, Err(KeepError::RestoreFailed(_))));
        assert_eq!(fx.item_count().await, 2);
        assert!(list_pre_restore_snapshots(&fx.backup_dir).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_backup_is_refused() {
        let fx = Fixture::new().await;
        let result = restore_backup(fx.ctx(Duration::from_secs(1)), "nope.db").await;
        assert!(matches!(result, Err(KeepError::RestoreFailed(_))));
        assert_eq!(fx.item_count().await, 2);
    }

    #[tokio::test]
    async fn test_corrupt_backup_is_refused_before_touching_live_file() {
        let fx = Fixture::new().await;
        std::fs::create_dir_all(&fx.backup_dir).unwrap();
        std::fs::write(fx.backup_dir.join("garbage.db"), vec![0x42u8; 8192]).unwrap();

        let result = restore_backup(fx.ctx(Duration::from_secs(1)), "garbage.db").await;

        assert!(matches!(result, Err(KeepError::RestoreFailed(_))));
        assert!(!fx.pool.read().await.is_closed());
        assert_eq!(fx.item_count().await, 2);
        assert!(list_pre_restore_snapshots(&fx.backup_dir).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_held_connection_aborts_restore_and_pool_comes_back() {
        let fx = Fixture::new().await;
        let pool = fx.pool.read().await.clone();
        create_backup(&pool, &fx.backup_dir, Some("b1"), 10)
            .await
            .unwrap();
        let held = pool.acquire().await.unwrap();

        let result = restore_backup(fx.ctx(Duration::from_millis(100)), "b1").await;
        assert!(matches!(result, Err(KeepError::RestoreFailed(_))));

        // The straggler's handle was closed under it
        let stale = held
            .interact(|conn| conn.execute_batch("SELECT 1").map_err(Into::into))
            .await;
        assert!(matches!(stale, Err(KeepError::ConnectionClosed)));
        drop(held);

        assert!(!fx.pool.read().await.is_closed());
        assert_eq!(fx.item_count().await, 2);
        assert!(list_pre_restore_snapshots(&fx.backup_dir).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_follow_retention() {
        let fx = Fixture::new().await;
        let pool = fx.pool.read().await.clone();
        create_backup(&pool, &fx.backup_dir, Some("base"), 10)
            .await
            .unwrap();
        drop(pool);

        for _ in 0..4 {
            let ctx = RestoreContext {
                retention: 2,
                ..fx.ctx(Duration::from_secs(2))
            };
            restore_backup(ctx, "base").await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(list_pre_restore_snapshots(&fx.backup_dir).unwrap().len(), 2);
    }
}
