// src/maintenance/vacuum.rs
// Space reclamation: fragmentation-gated VACUUM and WAL checkpoints

use crate::db::pool::ConnectionPool;
use crate::error::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::time::Instant;

/// Default fragmentation percentage above which VACUUM runs.
pub const DEFAULT_FRAGMENTATION_THRESHOLD: f64 = 25.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VacuumResult {
    /// False when fragmentation was below the threshold and nothing ran
    pub vacuumed: bool,
    pub fragmentation_before: f64,
    pub fragmentation_after: f64,
    pub size_before_bytes: u64,
    pub size_after_bytes: u64,
    pub duration_ms: u64,
}

/// Page statistics used to compute fragmentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageStats {
    pub page_count: u64,
    pub page_size: u64,
    pub freelist_count: u64,
}

impl PageStats {
    pub fn read(conn: &Connection) -> rusqlite::Result<Self> {
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let freelist_count: i64 = conn.query_row("PRAGMA freelist_count", [], |r| r.get(0))?;
        Ok(Self {
            page_count: page_count.max(0) as u64,
            page_size: page_size.max(0) as u64,
            freelist_count: freelist_count.max(0) as u64,
        })
    }

    /// Free pages as a percentage of all pages; 0 for an empty database.
    pub fn fragmentation(&self) -> f64 {
        if self.page_count == 0 {
            0.0
        } else {
            self.freelist_count as f64 / self.page_count as f64 * 100.0
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.page_count * self.page_size
    }
}

/// Compact the database if fragmentation is at or above `threshold` percent.
///
/// With `check_fragmentation == false` the VACUUM always runs.
pub async fn vacuum(
    pool: &ConnectionPool,
    check_fragmentation: bool,
    threshold: f64,
) -> Result<VacuumResult> {
    let conn = pool.acquire().await?;
    let result = conn
        .interact(move |conn| {
            let start = Instant::now();
            let before = PageStats::read(conn)?;
            let fragmentation_before = before.fragmentation();

            if check_fragmentation && fragmentation_before < threshold {
                return Ok(VacuumResult {
                    vacuumed: false,
                    fragmentation_before,
                    fragmentation_after: fragmentation_before,
                    size_before_bytes: before.size_bytes(),
                    size_after_bytes: before.size_bytes(),
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }

            conn.execute_batch("VACUUM")?;
            let after = PageStats::read(conn)?;
            Ok(VacuumResult {
                vacuumed: true,
                fragmentation_before,
                fragmentation_after: after.fragmentation(),
                size_before_bytes: before.size_bytes(),
                size_after_bytes: after.size_bytes(),
                duration_ms: start.elapsed().as_millis() as u64,
            })
        })
        .await?;

    if result.vacuumed {
        tracing::info!(
            fragmentation_before = result.fragmentation_before,
            fragmentation_after = result.fragmentation_after,
            reclaimed_bytes = result.size_before_bytes.saturating_sub(result.size_after_bytes),
            "Database vacuumed"
        );
    } else {
        tracing::debug!(
            fragmentation = result.fragmentation_before,
            threshold,
            "Vacuum skipped, fragmentation below threshold"
        );
    }
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointResult {
    /// True if a reader or writer kept the checkpoint from completing
    pub busy: bool,
    pub wal_frames: i64,
    pub checkpointed_frames: i64,
}

/// `PRAGMA wal_checkpoint(TRUNCATE)`: copy the WAL into the database file and
/// truncate it to zero bytes.
pub async fn checkpoint(pool: &ConnectionPool) -> Result<CheckpointResult> {
    let conn = pool.acquire().await?;
    let result = conn
        .interact(|conn| {
            let result = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |r| {
                Ok(CheckpointResult {
                    busy: r.get::<_, i64>(0)? != 0,
                    wal_frames: r.get(1)?,
                    checkpointed_frames: r.get(2)?,
                })
            })?;
            Ok(result)
        })
        .await?;

    if result.busy {
        tracing::warn!(
            wal_frames = result.wal_frames,
            checkpointed = result.checkpointed_frames,
            "WAL checkpoint could not complete, database busy"
        );
    } else {
        tracing::info!(frames = result.checkpointed_frames, "WAL checkpoint complete");
    }
    Ok(result)
}
