// src/maintenance/integrity.rs
// Integrity checker: header + PRAGMA integrity_check, diagnostics, health log

use crate::db::header::DatabaseHeader;
use crate::db::health_log::insert_health_check;
use crate::db::pool::ConnectionPool;
use crate::db::settings::{DurabilitySettings, synchronous_name};
use crate::error::{KeepError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

/// Outcome classification of an integrity check.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::IntoStaticStr,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Consistency check returned exactly `ok`
    Healthy,
    /// The file itself is damaged; recovery means restoring a backup
    Corrupted,
    /// The check could not run (pool exhausted, I/O failure, ...)
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityResult {
    pub checked_at: DateTime<Utc>,
    pub status: HealthStatus,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub db_size_bytes: Option<u64>,
    pub journal_mode: Option<String>,
    pub synchronous: Option<String>,
}

impl IntegrityResult {
    fn started(checked_at: DateTime<Utc>) -> Self {
        Self {
            checked_at,
            status: HealthStatus::Healthy,
            errors: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
            db_size_bytes: None,
            journal_mode: None,
            synchronous: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Everything read from the live connection in one blocking call.
struct Diagnostics {
    check_rows: Vec<String>,
    journal_mode: String,
    synchronous: i64,
    db_size_bytes: u64,
}

/// Rows of `PRAGMA integrity_check`; `["ok"]` means consistent.
fn integrity_rows(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn is_ok(rows: &[String]) -> bool {
    rows.len() == 1 && rows[0].eq_ignore_ascii_case("ok")
}

fn collect_diagnostics(conn: &Connection) -> rusqlite::Result<Diagnostics> {
    let check_rows = integrity_rows(conn)?;
    let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?;
    let synchronous: i64 = conn.query_row("PRAGMA synchronous", [], |r| r.get(0))?;
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
    Ok(Diagnostics {
        check_rows,
        journal_mode,
        synchronous,
        db_size_bytes: (page_count.max(0) as u64) * (page_size.max(0) as u64),
    })
}

/// Check the on-disk header. `Some(message)` when it is damaged.
fn header_problem(path: &Path) -> std::io::Result<Option<String>> {
    Ok(match DatabaseHeader::read_from(path)? {
        Some(Err(problem)) => Some(problem),
        Some(Ok(_)) | None => None,
    })
}

/// Run a full check of the live database and record it in the health log.
///
/// Never fails: problems are reported through `status` and `errors`.
pub async fn check_integrity(
    pool: &ConnectionPool,
    settings: &DurabilitySettings,
    log_cap: usize,
) -> IntegrityResult {
    let start = Instant::now();
    let mut result = IntegrityResult::started(Utc::now());

    let path = pool.path().to_path_buf();
    match tokio::task::spawn_blocking(move || header_problem(&path)).await {
        Ok(Ok(Some(problem))) => {
            result.status = HealthStatus::Corrupted;
            result.errors.push(problem);
        }
        Ok(Ok(None)) => {}
        Ok(Err(e)) => result
            .warnings
            .push(format!("could not read database header: {e}")),
        Err(e) => result
            .warnings
            .push(format!("header check did not complete: {e}")),
    }

    if result.status != HealthStatus::Corrupted {
        match run_diagnostics(pool).await {
            Ok(diag) => apply_diagnostics(&mut result, diag, settings),
            Err(e) if e.is_corruption() => {
                result.status = HealthStatus::Corrupted;
                result.errors.push(e.to_string());
            }
            Err(e) => {
                result.status = HealthStatus::Error;
                result.errors.push(e.to_string());
            }
        }
    }

    result.duration_ms = start.elapsed().as_millis() as u64;

    if let Err(e) = record(pool, &result, log_cap).await {
        tracing::warn!("Could not record health check: {}", e);
    }

    match result.status {
        HealthStatus::Healthy => tracing::info!(
            duration_ms = result.duration_ms,
            warnings = result.warnings.len(),
            "Integrity check passed"
        ),
        HealthStatus::Corrupted => tracing::error!(
            errors = ?result.errors,
            "Integrity check found corruption"
        ),
        HealthStatus::Error => tracing::warn!(
            errors = ?result.errors,
            "Integrity check could not complete"
        ),
    }

    result
}

async fn run_diagnostics(pool: &ConnectionPool) -> Result<Diagnostics> {
    let conn = pool.acquire().await?;
    conn.interact(|conn| collect_diagnostics(conn).map_err(Into::into))
        .await
}

fn apply_diagnostics(result: &mut IntegrityResult, diag: Diagnostics, settings: &DurabilitySettings) {
    if is_ok(&diag.check_rows) {
        result.status = HealthStatus::Healthy;
    } else {
        result.status = HealthStatus::Corrupted;
        result.errors.extend(diag.check_rows);
    }

    if !diag.journal_mode.eq_ignore_ascii_case(&settings.journal_mode) {
        result.warnings.push(format!(
            "journal_mode is {}, expected {}",
            diag.journal_mode, settings.journal_mode
        ));
    }
    if settings.expected_synchronous() != Some(diag.synchronous) {
        result.warnings.push(format!(
            "synchronous is {}, expected {}",
            synchronous_name(diag.synchronous),
            settings.synchronous.to_uppercase()
        ));
    }

    result.journal_mode = Some(diag.journal_mode);
    result.synchronous = Some(synchronous_name(diag.synchronous));
    result.db_size_bytes = Some(diag.db_size_bytes);
}

async fn record(pool: &ConnectionPool, result: &IntegrityResult, log_cap: usize) -> Result<()> {
    let conn = pool.acquire().await?;
    let result = result.clone();
    conn.interact(move |conn| insert_health_check(conn, &result, log_cap).map(|_| ()))
        .await
}

/// Verify a standalone database file (a backup, or a file about to be installed).
///
/// Returns `KeepError::Integrity` listing every problem found. Blocking.
///
/// Unlike the live database, a standalone file must carry a complete header
/// and at least one page: SQLite treats an empty file as a valid new database.
pub fn verify_file(path: &Path) -> Result<()> {
    match DatabaseHeader::read_from(path)? {
        None => {
            return Err(KeepError::Integrity(vec![format!(
                "{} is shorter than a database header",
                path.display()
            )]));
        }
        Some(Err(problem)) => return Err(KeepError::Integrity(vec![problem])),
        Some(Ok(_)) => {}
    }

    // No CREATE flag: a missing file is an error, not a new empty database.
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let (rows, page_count) = Connection::open_with_flags(path, flags)
        .and_then(|conn| {
            let rows = integrity_rows(&conn)?;
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            Ok((rows, page_count))
        })
        .map_err(|e| {
            if crate::error::is_corruption(&e) {
                KeepError::Integrity(vec![e.to_string()])
            } else {
                KeepError::Db(e)
            }
        })?;

    if !is_ok(&rows) {
        return Err(KeepError::Integrity(rows));
    }
    if page_count <= 0 {
        return Err(KeepError::Integrity(vec![format!(
            "{} has no pages",
            path.display()
        )]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::health_log::count_health_checks;
    use crate::db::pool::PoolConfig;
    use crate::db::schema::ensure_schema;
    use std::io::{Seek, SeekFrom, Write};
    use std::time::Duration;

    async fn open_pool(path: &Path, max_connections: usize) -> ConnectionPool {
        let pool = ConnectionPool::open(
            PoolConfig {
                path: path.to_path_buf(),
                max_connections,
                acquire_timeout: Duration::from_millis(500),
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
                 INSERT INTO items(name) VALUES ('a'), ('b'), ('c');",
            )?;
            Ok(())
        })
        .await
        .unwrap();
        pool
    }

    fn smash_header(path: &Path) {
        let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(b"this is not sqlite at all, sorry").unwrap();
        file.sync_all().unwrap();
    }

    #[tokio::test]
    async fn test_healthy_database() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("live.db"), 2).await;

        let result = check_integrity(&pool, &DurabilitySettings::default(), 100).await;

        assert_eq!(result.status, HealthStatus::Healthy, "{:?}", result.errors);
        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        assert_eq!(result.journal_mode.as_deref(), Some("wal"));
        assert_eq!(result.synchronous.as_deref(), Some("NORMAL"));
        assert!(result.db_size_bytes.unwrap() > 0);

        let conn = pool.acquire().await.unwrap();
        let logged = conn
            .interact(|conn| count_health_checks(conn))
            .await
            .unwrap();
        assert_eq!(logged, 1);
    }

    #[tokio::test]
    async fn test_settings_drift_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("live.db"), 1).await;

        let expected = DurabilitySettings {
            synchronous: "FULL".to_string(),
            ..Default::default()
        };
        let result = check_integrity(&pool, &expected, 100).await;

        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("synchronous"));
    }

    #[tokio::test]
    async fn test_damaged_header_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.db");
        let pool = open_pool(&path, 1).await;

        smash_header(&path);
        let result = check_integrity(&pool, &DurabilitySettings::default(), 100).await;

        assert_eq!(result.status, HealthStatus::Corrupted);
        assert!(!result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_error_not_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("live.db"), 1).await;

        let _held = pool.acquire().await.unwrap();
        let result = check_integrity(&pool, &DurabilitySettings::default(), 100).await;

        assert_eq!(result.status, HealthStatus::Error);
        assert!(result.errors[0].contains("timed out"));
    }

    #[test]
    fn test_verify_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.db");
        {
            let conn = Connection::open(&good).unwrap();
            conn.execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (1);")
                .unwrap();
        }
        assert!(verify_file(&good).is_ok());

        let bad = dir.path().join("bad.db");
        std::fs::copy(&good, &bad).unwrap();
        smash_header(&bad);
        assert!(matches!(verify_file(&bad), Err(KeepError::Integrity(_))));

        assert!(verify_file(&dir.path().join("missing.db")).is_err());
    }

    #[test]
    fn test_verify_file_rejects_empty_and_truncated_files() {
        let dir = tempfile::tempdir().unwrap();

        let empty = dir.path().join("empty.db");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(verify_file(&empty), Err(KeepError::Integrity(_))));

        let good = dir.path().join("good.db");
        {
            let conn = Connection::open(&good).unwrap();
            conn.execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (1);")
                .unwrap();
        }
        let bytes = std::fs::read(&good).unwrap();
        let truncated = dir.path().join("truncated.db");
        std::fs::write(&truncated, &bytes[..64]).unwrap();
        assert!(matches!(verify_file(&truncated), Err(KeepError::Integrity(_))));

        // Nothing was created in place of the rejected file
        assert_eq!(std::fs::metadata(&empty).unwrap().len(), 0);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(HealthStatus::Corrupted.as_str(), "corrupted");
        assert_eq!("healthy".parse::<HealthStatus>().unwrap(), HealthStatus::Healthy);
        assert_eq!(
            serde_json::to_string(&HealthStatus::Error).unwrap(),
            "\"error\""
        );
    }
}
