// src/background/integrity_lane.rs
// Integrity worker: periodic checks with automatic recovery

use crate::manager::{Manager, RecoveryOutcome};
use std::sync::Arc;
use tokio::sync::watch;

use super::sleep_or_shutdown;

pub struct IntegrityWorker {
    manager: Arc<Manager>,
    shutdown: watch::Receiver<bool>,
}

impl IntegrityWorker {
    pub fn new(manager: Arc<Manager>, shutdown: watch::Receiver<bool>) -> Self {
        Self { manager, shutdown }
    }

    /// Check on start, then every `integrity_interval`. Anything short of a
    /// healthy (or successfully restored) database waits `integrity_retry_delay`.
    pub async fn run(mut self) {
        tracing::info!("Integrity worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let cycle = self.manager.run_integrity_cycle().await;
            match &cycle.recovery {
                None => tracing::info!(
                    status = cycle.integrity.status.as_str(),
                    duration_ms = cycle.integrity.duration_ms,
                    warnings = cycle.integrity.warnings.len(),
                    "Scheduled integrity check complete"
                ),
                Some(RecoveryOutcome::Restored { report }) => {
                    tracing::info!(backup = %report.backup.name, "Database restored after corruption")
                }
                Some(RecoveryOutcome::Failed { backup, error }) => {
                    tracing::error!(backup = %backup, "Recovery failed: {}", error)
                }
                Some(RecoveryOutcome::NoBackup) => {
                    tracing::error!("Database corrupted and no backup to restore")
                }
            }

            let delay = if cycle.succeeded() {
                self.manager.config().integrity_interval()
            } else {
                self.manager.config().integrity_retry_delay()
            };

            if sleep_or_shutdown(&mut self.shutdown, delay).await {
                break;
            }
        }

        tracing::info!("Integrity worker shutting down");
    }
}
