// src/background/mod.rs
// Background workers for periodic maintenance
//
// Two lanes share one shutdown channel:
// - Backup lane: verified backup, then retention pruning
// - Integrity lane: integrity check, automatic restore on corruption

mod backup_lane;
mod integrity_lane;

use crate::manager::Manager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use backup_lane::BackupWorker;
pub use integrity_lane::IntegrityWorker;

/// Running workers plus the sender that stops them
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    /// Signal shutdown and join every worker for at most `timeout`.
    ///
    /// A worker still running by then is mid-backup or mid-restore. It is left
    /// to finish on its own, never aborted. Returns how many were left running.
    pub async fn stop(self, timeout: Duration) -> usize {
        // Err only means every receiver is gone already
        let _ = self.shutdown.send(true);

        let deadline = Instant::now() + timeout;
        let mut detached = 0;
        for (name, mut handle) in self.handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(worker = name, "Worker joined"),
                Ok(Err(e)) => tracing::warn!(worker = name, "Worker ended abnormally: {}", e),
                Err(_) => {
                    // Dropping the handle detaches the task
                    tracing::warn!(
                        worker = name,
                        "Worker did not stop in time, leaving it to finish its current job"
                    );
                    detached += 1;
                }
            }
        }
        detached
    }
}

/// Spawn both background workers
pub fn spawn(manager: Arc<Manager>) -> Workers {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let backup = BackupWorker::new(manager.clone(), shutdown_rx.clone());
    let backup_handle = tokio::spawn(async move {
        backup.run().await;
    });

    let integrity = IntegrityWorker::new(manager, shutdown_rx);
    let integrity_handle = tokio::spawn(async move {
        integrity.run().await;
    });

    Workers {
        shutdown: shutdown_tx,
        handles: vec![("backup", backup_handle), ("integrity", integrity_handle)],
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
/// Returns true when the worker should stop.
pub(crate) async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => match changed {
            Ok(()) => *shutdown.borrow(),
            // Sender dropped
            Err(_) => true,
        },
    }
}
