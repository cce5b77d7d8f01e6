// src/cli/run.rs
// CLI handler for `keepsafe --run`

use anyhow::Result;
use keepsafe::{Manager, ManagerConfig};
use std::sync::Arc;
use tracing::info;

/// Start the manager with its workers and run until Ctrl-C.
pub async fn run_until_interrupted(config: ManagerConfig) -> Result<()> {
    let manager = Arc::new(Manager::open(config).await?);
    manager.start().await?;

    let config = manager.config();
    info!(
        db = %config.db_path.display(),
        backup_every_secs = config.backup_interval_secs,
        check_every_secs = config.integrity_interval_secs,
        "Keepsafe running, press Ctrl-C to stop"
    );

    let interrupted = tokio::signal::ctrl_c().await;
    manager.shutdown().await;
    interrupted?;
    Ok(())
}
