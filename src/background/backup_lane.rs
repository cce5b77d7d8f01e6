// src/background/backup_lane.rs
// Backup worker: periodic verified backups with retention

use crate::manager::Manager;
use std::sync::Arc;
use tokio::sync::watch;

use super::sleep_or_shutdown;

/// Backs up on start, then every `backup_interval`.
/// A failed backup is retried after `backup_retry_delay`.
pub struct BackupWorker {
    manager: Arc<Manager>,
    shutdown: watch::Receiver<bool>,
}

impl BackupWorker {
    pub fn new(manager: Arc<Manager>, shutdown: watch::Receiver<bool>) -> Self {
        Self { manager, shutdown }
    }

    pub async fn run(mut self) {
        tracing::info!("Backup worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let delay = match self.manager.run_backup_cycle().await {
                Ok(record) => {
                    tracing::info!(
                        backup = %record.name,
                        size_bytes = record.size_bytes,
                        "Scheduled backup complete"
                    );
                    self.manager.config().backup_interval()
                }
                Err(e) => {
                    let retry = self.manager.config().backup_retry_delay();
                    tracing::warn!(
                        retry_secs = retry.as_secs(),
                        "Scheduled backup failed: {}",
                        e
                    );
                    retry
                }
            };

            if sleep_or_shutdown(&mut self.shutdown, delay).await {
                break;
            }
        }

        tracing::info!("Backup worker shutting down");
    }
}
