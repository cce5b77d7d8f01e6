// src/db/health_log.rs
// Capped log of integrity check results (health_checks table)

use crate::error::Result;
use crate::maintenance::integrity::{HealthStatus, IntegrityResult};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use std::str::FromStr;

/// Default number of health check rows kept.
pub const DEFAULT_LOG_CAP: usize = 100;

/// A persisted health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckRecord {
    pub id: i64,
    #[serde(flatten)]
    pub result: IntegrityResult,
}

/// Insert one result and trim the table to the newest `cap` rows, atomically.
pub fn insert_health_check(conn: &mut Connection, result: &IntegrityResult, cap: usize) -> Result<i64> {
    let errors = serde_json::to_string(&result.errors)?;
    let warnings = serde_json::to_string(&result.warnings)?;

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO health_checks
            (checked_at, status, errors, warnings, duration_ms, db_size_bytes, journal_mode, synchronous)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            result.checked_at.to_rfc3339(),
            result.status.as_str(),
            errors,
            warnings,
            result.duration_ms as i64,
            result.db_size_bytes.map(|b| b as i64),
            result.journal_mode,
            result.synchronous,
        ],
    )?;
    let id = tx.last_insert_rowid();
    let pruned = tx.execute(
        "DELETE FROM health_checks WHERE id NOT IN
            (SELECT id FROM health_checks ORDER BY id DESC LIMIT ?1)",
        [cap as i64],
    )?;
    tx.commit()?;

    if pruned > 0 {
        tracing::debug!(pruned, cap, "Trimmed health check log");
    }
    Ok(id)
}

/// Most recent health checks, newest first.
pub fn recent_health_checks(conn: &Connection, limit: usize) -> Result<Vec<HealthCheckRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, checked_at, status, errors, warnings, duration_ms, db_size_bytes, journal_mode, synchronous
         FROM health_checks ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| {
            Ok(RawRow {
                id: row.get(0)?,
                checked_at: row.get(1)?,
                status: row.get(2)?,
                errors: row.get(3)?,
                warnings: row.get(4)?,
                duration_ms: row.get(5)?,
                db_size_bytes: row.get(6)?,
                journal_mode: row.get(7)?,
                synchronous: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows.into_iter().map(RawRow::into_record).collect())
}

pub fn count_health_checks(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM health_checks", [], |r| r.get(0))?)
}

struct RawRow {
    id: i64,
    checked_at: String,
    status: String,
    errors: String,
    warnings: String,
    duration_ms: i64,
    db_size_bytes: Option<i64>,
    journal_mode: Option<String>,
    synchronous: Option<String>,
}

impl RawRow {
    /// Rows written by other tools may not parse; keep them visible as `error`.
    fn into_record(self) -> HealthCheckRecord {
        let checked_at = DateTime::parse_from_rfc3339(&self.checked_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_default();
        let status = HealthStatus::from_str(&self.status).unwrap_or(HealthStatus::Error);

        HealthCheckRecord {
            id: self.id,
            result: IntegrityResult {
                checked_at,
                status,
                errors: serde_json::from_str(&self.errors).unwrap_or_default(),
                warnings: serde_json::from_str(&self.warnings).unwrap_or_default(),
                duration_ms: self.duration_ms.max(0) as u64,
                db_size_bytes: self.db_size_bytes.map(|b| b.max(0) as u64),
                journal_mode: self.journal_mode,
                synchronous: self.synchronous,
            },
        }
    }
}
