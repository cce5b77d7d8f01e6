// src/db/schema.rs
// The two tables keepsafe owns inside the managed database

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};

/// Bumped when the owned tables change shape.
pub const SCHEMA_VERSION: &str = "1";

const HEALTH_CHECKS_SQL: &str = "
CREATE TABLE IF NOT EXISTS health_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    checked_at TEXT NOT NULL,
    status TEXT NOT NULL,
    errors TEXT NOT NULL DEFAULT '[]',
    warnings TEXT NOT NULL DEFAULT '[]',
    duration_ms INTEGER NOT NULL DEFAULT 0,
    db_size_bytes INTEGER,
    journal_mode TEXT,
    synchronous TEXT
);
CREATE INDEX IF NOT EXISTS idx_health_checks_checked_at ON health_checks(checked_at);
";

const SYSTEM_INFO_SQL: &str = "
CREATE TABLE IF NOT EXISTS system_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// Create the owned tables if missing and record the schema version.
///
/// Idempotent; runs at manager start and again after every restore, since the
/// restored file may predate these tables.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    create_table_if_missing(conn, "health_checks", HEALTH_CHECKS_SQL)?;
    create_table_if_missing(conn, "system_info", SYSTEM_INFO_SQL)?;
    system_info_set(conn, "schema_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Check if a table exists in the database
pub fn table_exists(conn: &Connection, table_name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?",
        [table_name],
        |_| Ok(true),
    )
    .unwrap_or(false)
}

/// Create a table if it doesn't exist (with logging)
pub fn create_table_if_missing(conn: &Connection, table_name: &str, sql: &str) -> Result<()> {
    if table_exists(conn, table_name) {
        return Ok(());
    }

    tracing::info!("Creating {} table", table_name);
    conn.execute_batch(sql)?;
    Ok(())
}

pub fn system_info_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM system_info WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn system_info_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO system_info (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!table_exists(&conn, "health_checks"));

        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();

        assert!(table_exists(&conn, "health_checks"));
        assert!(table_exists(&conn, "system_info"));
        assert_eq!(
            system_info_get(&conn, "schema_version").unwrap().as_deref(),
            Some(SCHEMA_VERSION)
        );
    }

    #[test]
    fn test_system_info_upsert() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();

        assert_eq!(system_info_get(&conn, "last_backup").unwrap(), None);
        system_info_set(&conn, "last_backup", "a.db").unwrap();
        system_info_set(&conn, "last_backup", "b.db").unwrap();
        assert_eq!(
            system_info_get(&conn, "last_backup").unwrap().as_deref(),
            Some("b.db")
        );

        let rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM system_info WHERE key = 'last_backup'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_existing_user_tables_survive() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE notes(id INTEGER PRIMARY KEY, body TEXT); INSERT INTO notes(body) VALUES ('keep me');")
            .unwrap();
        ensure_schema(&conn).unwrap();

        let body: String = conn
            .query_row("SELECT body FROM notes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(body, "keep me");
    }
}
