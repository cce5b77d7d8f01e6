// src/manager.rs
// Manager: owns the pool and engines, runs the background workers

use crate::background::{self, Workers};
use crate::config::ManagerConfig;
use crate::db::header::DatabaseHeader;
use crate::db::health_log::{HealthCheckRecord, recent_health_checks};
use crate::db::pool::{ConnectionPool, PoolStats, PooledConnection};
use crate::db::settings::SettingWarning;
use crate::db::schema::{ensure_schema, system_info_get, system_info_set};
use crate::error::{KeepError, Result};
use crate::maintenance::backup::{self, BackupRecord};
use crate::maintenance::integrity::{self, HealthStatus, IntegrityResult};
use crate::maintenance::restore::{self, RestoreContext, RestoreReport};
use crate::maintenance::vacuum::{self, CheckpointResult, VacuumResult};
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Status is informational; it does not queue behind busy callers for long.
const STATUS_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause before re-reading the pool after it was found closed mid-swap.
const POOL_SWAP_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Lifecycle of a manager. Transitions only move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl ManagerState {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    fn accepts_work(&self) -> bool {
        matches!(self, ManagerState::Initializing | ManagerState::Running)
    }
}

/// What one integrity worker iteration did about a corrupted database.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Restored { report: Box<RestoreReport> },
    Failed { backup: String, error: String },
    NoBackup,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityCycle {
    pub integrity: IntegrityResult,
    pub recovery: Option<RecoveryOutcome>,
}

impl IntegrityCycle {
    /// Healthy, or corrupted and successfully restored.
    pub fn succeeded(&self) -> bool {
        match (&self.integrity.status, &self.recovery) {
            (HealthStatus::Healthy, _) => true,
            (_, Some(RecoveryOutcome::Restored { .. })) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub state: ManagerState,
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub pool: PoolStats,
    /// Durability settings the pool could not apply
    pub setting_warnings: Vec<SettingWarning>,
    /// Opened over a damaged file; cleared by a successful restore
    pub recovery_pending: bool,
    pub workers_running: bool,
    pub backup_count: usize,
    pub latest_backup: Option<BackupRecord>,
    pub last_health_check: Option<HealthCheckRecord>,
}

/// Durable connection pool plus backup, integrity and recovery management for
/// one SQLite database file.
///
/// Built once by the caller and shared as `Arc<Manager>`.
pub struct Manager {
    config: ManagerConfig,
    backup_dir: PathBuf,
    /// Write-locked by restore for the whole close/swap/reopen phase
    pool: RwLock<ConnectionPool>,
    state: Mutex<ManagerState>,
    workers: tokio::sync::Mutex<Option<Workers>>,
    /// One restore at a time, whoever asks
    restore_lock: tokio::sync::Mutex<()>,
    recovery_pending: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `Some(problem)` when the file exists and its header is damaged.
fn header_damage(path: &Path) -> Option<String> {
    match DatabaseHeader::read_from(path) {
        Ok(Some(Err(problem))) => Some(problem),
        Ok(_) => None,
        // Missing file: the pool creates it
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => Some(format!("could not read database header: {e}")),
    }
}

/// Create the owned tables and stamp the open time.
async fn prepare_schema(pool: &ConnectionPool) -> Result<()> {
    let conn = pool.acquire().await?;
    conn.interact(|conn| {
        ensure_schema(conn)?;
        system_info_set(conn, "opened_at", &chrono::Utc::now().to_rfc3339())?;
        Ok(())
    })
    .await
}

impl Manager {
    /// Validate the config, create directories, open the pool and ensure the
    /// owned tables exist. The manager is `Initializing` until `start`.
    ///
    /// A damaged database file does not stop the manager from opening: the
    /// schema step is skipped and `status().recovery_pending` is set, so the
    /// file can still be checked and restored.
    pub async fn open(config: ManagerConfig) -> Result<Self> {
        config.validate().into_result()?;

        let backup_dir = config.backup_dir();
        std::fs::create_dir_all(&backup_dir)?;
        match backup::remove_partial_backups(&backup_dir) {
            Ok(0) => {}
            Ok(removed) => tracing::warn!(removed, "Removed backups left unfinished by an earlier run"),
            Err(e) => tracing::warn!("Could not clean up partial backups: {}", e),
        }

        let pool = ConnectionPool::open(config.pool_config(), config.settings.clone()).await?;

        let db_path = config.db_path.clone();
        let damage = match tokio::task::spawn_blocking(move || header_damage(&db_path)).await? {
            Some(problem) => Some(KeepError::Integrity(vec![problem])),
            None => prepare_schema(&pool).await.err(),
        };
        let recovery_pending = match damage {
            None => false,
            Some(e) if e.is_corruption() => {
                tracing::error!(
                    db = %config.db_path.display(),
                    "Database is damaged, opened for recovery only: {}",
                    e
                );
                true
            }
            Some(e) => return Err(e),
        };

        tracing::info!(
            db = %config.db_path.display(),
            backups = %backup_dir.display(),
            recovery_pending,
            "Manager initialized"
        );

        Ok(Self {
            backup_dir,
            pool: RwLock::new(pool),
            state: Mutex::new(ManagerState::Initializing),
            workers: tokio::sync::Mutex::new(None),
            restore_lock: tokio::sync::Mutex::new(()),
            recovery_pending: AtomicBool::new(recovery_pending),
            config,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn state(&self) -> ManagerState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ManagerState) {
        let mut current = lock(&self.state);
        if state > *current {
            tracing::debug!(from = current.as_str(), to = state.as_str(), "Manager state change");
            *current = state;
        }
    }

    /// Current pool handle. Waits while a restore holds the write lock.
    async fn current_pool(&self) -> ConnectionPool {
        self.pool.read().await.clone()
    }

    /// Acquire a connection with the configured timeout.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.config.acquire_timeout()).await
    }

    /// Acquire a connection, waiting at most `timeout` in total, including any
    /// time spent waiting for a restore to finish.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.state().accepts_work() {
                return Err(KeepError::PoolClosed);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let pool = tokio::time::timeout(remaining, self.current_pool())
                .await
                .map_err(|_| KeepError::PoolTimeout(timeout))?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            match pool.acquire_timeout(remaining).await {
                Ok(conn) => return Ok(conn),
                Err(KeepError::PoolTimeout(_)) => return Err(KeepError::PoolTimeout(timeout)),
                // A restore swapped the pool between our read and acquire
                Err(KeepError::PoolClosed) if Instant::now() < deadline => {
                    tokio::time::sleep(POOL_SWAP_RETRY_DELAY).await;
                }
                Err(KeepError::PoolClosed) => return Err(KeepError::PoolTimeout(timeout)),
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquire a connection and run `f` on it on the blocking pool.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.acquire().await?;
        conn.interact(f).await
    }

    /// Create a verified backup, then prune to the retention count.
    pub async fn create_backup(&self, name: Option<&str>) -> Result<BackupRecord> {
        if !self.state().accepts_work() {
            return Err(KeepError::BackupFailed("manager is shutting down".to_string()));
        }
        let pool = self.current_pool().await;
        let record =
            backup::create_backup(&pool, &self.backup_dir, name, self.config.retention_count)
                .await?;

        let backup_name = record.name.clone();
        if let Err(e) = self
            .interact(move |conn| system_info_set(conn, "last_backup", &backup_name))
            .await
        {
            tracing::debug!("Could not record last backup: {}", e);
        }
        Ok(record)
    }

    /// Restorable backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        backup::list_backups(&self.backup_dir)
    }

    /// Run a full integrity check. Never fails; see `IntegrityResult::status`.
    pub async fn check_integrity(&self) -> IntegrityResult {
        let pool = self.current_pool().await;
        integrity::check_integrity(&pool, &self.config.settings, self.config.health_log_cap).await
    }

    /// Most recent health checks, newest first.
    pub async fn health_history(&self, limit: usize) -> Result<Vec<HealthCheckRecord>> {
        self.interact(move |conn| recent_health_checks(conn, limit))
            .await
    }

    /// Replace the live database with the named backup.
    pub async fn restore(&self, name: &str) -> Result<RestoreReport> {
        if !self.state().accepts_work() {
            return Err(KeepError::RestoreFailed("manager is shutting down".to_string()));
        }
        let _only_one = self.restore_lock.lock().await;
        let report = restore::restore_backup(
            RestoreContext {
                pool: &self.pool,
                backup_dir: &self.backup_dir,
                retention: self.config.retention_count,
                drain_timeout: self.config.drain_timeout(),
                log_cap: self.config.health_log_cap,
            },
            name,
        )
        .await?;
        self.recovery_pending.store(false, Ordering::SeqCst);
        Ok(report)
    }

    /// VACUUM if fragmentation is at or above the threshold, or always with `force`.
    pub async fn vacuum(&self, force: bool) -> Result<VacuumResult> {
        let pool = self.current_pool().await;
        vacuum::vacuum(&pool, !force, self.config.fragmentation_threshold).await
    }

    /// Fold the WAL back into the main file.
    pub async fn checkpoint(&self) -> Result<CheckpointResult> {
        let pool = self.current_pool().await;
        vacuum::checkpoint(&pool).await
    }

    pub async fn system_info_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.interact(move |conn| system_info_get(conn, &key)).await
    }

    pub async fn system_info_set(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.interact(move |conn| system_info_set(conn, &key, &value))
            .await
    }

    pub async fn status(&self) -> Result<ManagerStatus> {
        let pool = self.current_pool().await;
        let backups = self.list_backups()?;
        let history = match pool.acquire_timeout(STATUS_ACQUIRE_TIMEOUT).await {
            Ok(conn) => conn.interact(|conn| recent_health_checks(conn, 1)).await,
            Err(e) => Err(e),
        };
        // A damaged file has no readable history; status still reports
        let last_health_check = match history {
            Ok(records) => records.into_iter().next(),
            Err(e) => {
                tracing::debug!("Status without health history: {}", e);
                None
            }
        };

        Ok(ManagerStatus {
            state: self.state(),
            db_path: self.config.db_path.clone(),
            backup_dir: self.backup_dir.clone(),
            pool: pool.stats(),
            setting_warnings: pool.setting_warnings(),
            recovery_pending: self.recovery_pending.load(Ordering::SeqCst),
            workers_running: self.workers.lock().await.is_some(),
            backup_count: backups.len(),
            latest_backup: backups.into_iter().next(),
            last_health_check,
        })
    }

    /// One backup worker iteration.
    pub async fn run_backup_cycle(&self) -> Result<BackupRecord> {
        self.create_backup(None).await
    }

    /// One integrity worker iteration: check, and on corruption restore the
    /// newest backup once. A failed restore is reported, not retried.
    pub async fn run_integrity_cycle(&self) -> IntegrityCycle {
        let integrity = self.check_integrity().await;
        if integrity.status != HealthStatus::Corrupted {
            return IntegrityCycle {
                integrity,
                recovery: None,
            };
        }

        tracing::error!("Corruption detected, attempting automatic recovery");
        let newest = match self.list_backups() {
            Ok(backups) => backups.into_iter().next(),
            Err(e) => {
                tracing::error!("Cannot list backups for recovery: {}", e);
                None
            }
        };

        let recovery = match newest {
            None => {
                tracing::error!("No backup available, operator intervention required");
                RecoveryOutcome::NoBackup
            }
            Some(backup) => match self.restore(&backup.name).await {
                Ok(report) => {
                    tracing::info!(backup = %backup.name, "Automatic recovery succeeded");
                    RecoveryOutcome::Restored {
                        report: Box::new(report),
                    }
                }
                Err(e) => {
                    tracing::error!(
                        backup = %backup.name,
                        "Automatic recovery failed, operator intervention required: {}",
                        e
                    );
                    RecoveryOutcome::Failed {
                        backup: backup.name,
                        error: e.to_string(),
                    }
                }
            },
        };

        IntegrityCycle {
            integrity,
            recovery: Some(recovery),
        }
    }

    /// Spawn the backup and integrity workers. Idempotent while running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers.lock().await;
        match self.state() {
            ManagerState::Running => return Ok(()),
            ManagerState::Initializing => {}
            state => {
                return Err(KeepError::InvalidInput(format!(
                    "cannot start a manager that is {}",
                    state.as_str()
                )));
            }
        }

        *workers = Some(background::spawn(self.clone()));
        self.set_state(ManagerState::Running);
        tracing::info!("Manager running");
        Ok(())
    }

    /// Stop the workers, close every connection. Idempotent.
    ///
    /// A backup or restore already running is never cancelled: a connection
    /// in use closes when its call returns.
    pub async fn shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if *state >= ManagerState::ShuttingDown {
                return;
            }
            *state = ManagerState::ShuttingDown;
        }
        tracing::info!("Manager shutting down");

        let workers = self.workers.lock().await.take();
        if let Some(workers) = workers {
            let still_running = workers.stop(self.config.shutdown_timeout()).await;
            if still_running > 0 {
                tracing::warn!(still_running, "Closing the pool under a worker that is finishing up");
            }
        }

        // Waits for a restore in progress to put its pool in place
        self.pool.read().await.close_all();
        self.set_state(ManagerState::Stopped);
        tracing::info!("Manager stopped");
    }
}
