// src/db/pool.rs
// Bounded SQLite connection pool with probe-on-checkout and scoped release
//
// # Access pattern
//
// ```ignore
// let conn = pool.acquire().await?;
// let count: i64 = conn
//     .interact(|conn| {
//         conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
//             .map_err(Into::into)
//     })
//     .await?;
// // `conn` goes back to the pool when it is dropped
// ```
//
// Capacity is a `tokio::sync::Semaphore` with one permit per connection, so at
// most `max_connections` handles ever exist. A checked-out connection carries
// its permit; dropping the guard returns both.
//
// Connections are probed with `SELECT 1` when checked out rather than when
// returned: a handle that dies while idle is only noticed (and replaced) when
// somebody actually needs it.

use crate::db::settings::{DurabilitySettings, SettingWarning, apply_settings};
use crate::error::{KeepError, Result};
use crate::utils::ResultExt;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// How often `wait_drained` re-checks the checked-out set.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Immutable pool parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub path: PathBuf,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
}

/// `None` once the pool has closed the handle.
type SharedConnection = Arc<Mutex<Option<Connection>>>;

struct Slot {
    id: u64,
    conn: SharedConnection,
}

struct PoolInner {
    config: PoolConfig,
    settings: DurabilitySettings,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Slot>>,
    checked_out: Mutex<HashMap<u64, SharedConnection>>,
    /// Every handle ever opened, to tell when the last one is really closed
    handles: Mutex<Vec<Weak<Mutex<Option<Connection>>>>>,
    /// What the most recently opened connection could not apply
    setting_warnings: Mutex<Vec<SettingWarning>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Pool snapshot for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max: usize,
    pub idle: usize,
    pub active: usize,
}

/// Thread-safe handle to the pool. Cloning is cheap and shares the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Recover the guard from a poisoned mutex; the protected bookkeeping stays
/// consistent because every critical section is a single push/pop/insert.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Open a connection and apply the durability settings to it.
fn open_connection(
    path: &Path,
    settings: &DurabilitySettings,
) -> rusqlite::Result<(Connection, Vec<SettingWarning>)> {
    let conn = Connection::open(path)?;
    let warnings = apply_settings(&conn, settings);
    Ok((conn, warnings))
}

/// Trivial round-trip on a shared handle.
fn probe(conn: &SharedConnection) -> std::result::Result<(), String> {
    let guard = conn
        .lock()
        .map_err(|_| "connection poisoned by a panic during a previous call".to_string())?;
    let conn = guard
        .as_ref()
        .ok_or_else(|| "connection handle is closed".to_string())?;
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
        .str_err()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseOutcome {
    Closed,
    AlreadyClosed,
    /// Mid-call; the handle closes when the last reference to its slot drops
    Busy,
}

/// Take the handle out of its slot and close it, without waiting on a busy one.
fn close_shared(conn: &SharedConnection) -> CloseOutcome {
    let taken = match conn.try_lock() {
        Ok(mut guard) => guard.take(),
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take(),
        Err(TryLockError::WouldBlock) => return CloseOutcome::Busy,
    };
    match taken {
        Some(conn) => {
            if let Err((_, e)) = conn.close() {
                tracing::warn!("Error while closing pooled connection: {}", e);
            }
            CloseOutcome::Closed
        }
        None => CloseOutcome::AlreadyClosed,
    }
}

impl ConnectionPool {
    /// Open a pool and eagerly create `max_connections` configured connections.
    pub async fn open(config: PoolConfig, settings: DurabilitySettings) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(KeepError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        ensure_parent_directory(&config.path)?;

        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            idle: Mutex::new(Vec::with_capacity(config.max_connections)),
            checked_out: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            setting_warnings: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            config,
            settings,
        });
        let pool = Self { inner };

        // Sequential on purpose: the first connection switches the file to WAL,
        // which needs an exclusive lock.
        for _ in 0..pool.inner.config.max_connections {
            let slot = pool.create_slot().await?;
            lock(&pool.inner.idle).push(slot);
        }

        tracing::info!(
            path = %pool.inner.config.path.display(),
            max_connections = pool.inner.config.max_connections,
            "Connection pool opened"
        );
        Ok(pool)
    }

    /// Acquire a connection, waiting up to the configured timeout.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Acquire a connection, waiting up to `timeout` for capacity.
    ///
    /// Dropping the returned future cancels the wait without side effects.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(KeepError::PoolClosed);
        }

        let permit =
            match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(KeepError::PoolClosed),
                Err(_) => return Err(KeepError::PoolTimeout(timeout)),
            };

        let idle = lock(&self.inner.idle).pop();
        let slot = match idle {
            Some(slot) => self.probe_or_replace(slot).await?,
            // A broken connection was discarded earlier; its permit is ours now.
            None => self
                .create_slot()
                .await
                .map_err(|e| KeepError::ConnectionBroken(e.to_string()))?,
        };

        lock(&self.inner.checked_out).insert(slot.id, slot.conn.clone());
        if self.is_closed() {
            lock(&self.inner.checked_out).remove(&slot.id);
            close_shared(&slot.conn);
            return Err(KeepError::PoolClosed);
        }

        Ok(PooledConnection {
            id: slot.id,
            conn: slot.conn,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Probe an idle slot; swap in a fresh connection if the probe fails.
    async fn probe_or_replace(&self, slot: Slot) -> Result<Slot> {
        let conn = slot.conn.clone();
        let probed = tokio::task::spawn_blocking(move || probe(&conn)).await?;

        let probe_error = match probed {
            Ok(()) => return Ok(slot),
            Err(e) => e,
        };

        tracing::warn!(
            connection = slot.id,
            "Pooled connection failed probe, replacing it: {}",
            probe_error
        );
        close_shared(&slot.conn);

        match self.create_slot().await {
            Ok(replacement) => {
                tracing::info!(
                    old = slot.id,
                    new = replacement.id,
                    "Replaced broken pooled connection"
                );
                Ok(replacement)
            }
            Err(e) => {
                tracing::error!("Could not open replacement connection: {}", e);
                Err(KeepError::ConnectionBroken(probe_error))
            }
        }
    }

    /// Open, configure and probe a new connection on the blocking pool.
    async fn create_slot(&self) -> Result<Slot> {
        let path = self.inner.config.path.clone();
        let settings = self.inner.settings.clone();
        let (conn, warnings) =
            tokio::task::spawn_blocking(move || -> Result<(Connection, Vec<SettingWarning>)> {
                let (conn, warnings) = open_connection(&path, &settings)?;
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok((conn, warnings))
            })
            .await??;
        *lock(&self.inner.setting_warnings) = warnings;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Mutex::new(Some(conn)));
        {
            let mut handles = lock(&self.inner.handles);
            handles.retain(|handle| handle.strong_count() > 0);
            handles.push(Arc::downgrade(&conn));
        }
        tracing::debug!(connection = id, "Opened pooled connection");
        Ok(Slot { id, conn })
    }

    /// Close every idle connection and every checked-out connection that is
    /// not in the middle of a call. Busy ones close when their call finishes.
    ///
    /// Waiters and later `acquire` calls fail with `PoolClosed`. Idempotent.
    pub fn close_all(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();

        let idle: Vec<Slot> = lock(&self.inner.idle).drain(..).collect();
        let busy: Vec<SharedConnection> = lock(&self.inner.checked_out).values().cloned().collect();

        let mut closed = 0;
        let mut deferred = 0;
        for conn in idle.iter().map(|slot| &slot.conn).chain(busy.iter()) {
            match close_shared(conn) {
                CloseOutcome::Closed => closed += 1,
                CloseOutcome::Busy => deferred += 1,
                CloseOutcome::AlreadyClosed => {}
            }
        }

        tracing::info!(
            closed,
            checked_out = busy.len(),
            deferred,
            "Connection pool closed"
        );
    }

    /// Wait until no connection is checked out and, once the pool is closed,
    /// no handle is still open. Returns false on timeout.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.is_drained() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    fn is_drained(&self) -> bool {
        if !lock(&self.inner.checked_out).is_empty() {
            return false;
        }
        !self.is_closed() || self.open_handles() == 0
    }

    /// Handles not yet closed. A handle that is mid-call counts as open.
    fn open_handles(&self) -> usize {
        let mut handles = lock(&self.inner.handles);
        handles.retain(|handle| handle.strong_count() > 0);
        handles
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|conn| match conn.try_lock() {
                Ok(guard) => guard.is_some(),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_some(),
                Err(TryLockError::WouldBlock) => true,
            })
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max: self.inner.config.max_connections,
            idle: lock(&self.inner.idle).len(),
            active: lock(&self.inner.checked_out).len(),
        }
    }

    /// Settings the most recently opened connection could not apply.
    pub fn setting_warnings(&self) -> Vec<SettingWarning> {
        lock(&self.inner.setting_warnings).clone()
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn settings(&self) -> &DurabilitySettings {
        &self.inner.settings
    }
}

/// Exclusive handle to one pooled connection.
///
/// Released back to the pool on drop, on every exit path: normal return, `?`,
/// panic unwinding, or a cancelled future holding it.
pub struct PooledConnection {
    id: u64,
    conn: SharedConnection,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Stable identifier of the underlying connection (changes on replacement).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run a closure against the connection on the blocking thread pool.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.pool.closed.load(Ordering::SeqCst) {
            close_shared(&self.conn);
            return Err(KeepError::ConnectionClosed);
        }

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                KeepError::ConnectionBroken(
                    "connection poisoned by a panic during a previous call".to_string(),
                )
            })?;
            match guard.as_mut() {
                Some(conn) => f(conn),
                None => Err(KeepError::ConnectionClosed),
            }
        })
        .await?
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        lock(&self.pool.checked_out).remove(&self.id);

        // The closed check happens under the idle lock so `close_all` either
        // sees this slot in the free list or we see the closed flag.
        let mut idle = lock(&self.pool.idle);
        if self.pool.closed.load(Ordering::SeqCst) {
            drop(idle);
            close_shared(&self.conn);
        } else {
            idle.push(Slot {
                id: self.id,
                conn: self.conn.clone(),
            });
        }
    }
}

/// Ensure the parent directory of the database file exists.
pub(crate) fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
