// src/cli/commands.rs
// One-shot command handlers; each prints its result as JSON

use super::Command;
use anyhow::{Result, bail};
use keepsafe::maintenance::HealthStatus;
use keepsafe::{Manager, ManagerConfig};
use serde::Serialize;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Open the manager, run one command, shut down.
pub async fn run_command(config: ManagerConfig, command: Command) -> Result<()> {
    let manager = Manager::open(config).await?;
    let outcome = dispatch(&manager, command).await;
    manager.shutdown().await;
    outcome
}

async fn dispatch(manager: &Manager, command: Command) -> Result<()> {
    match command {
        Command::Backup(name) => {
            let record = manager.create_backup(name.as_deref()).await?;
            print_json(&record)
        }
        Command::Integrity => {
            let result = manager.check_integrity().await;
            print_json(&result)?;
            if result.status != HealthStatus::Healthy {
                bail!("database is {}", result.status.as_str());
            }
            Ok(())
        }
        Command::Vacuum { force } => {
            let result = manager.vacuum(force).await?;
            print_json(&result)
        }
        Command::ListBackups => print_json(&manager.list_backups()?),
        Command::Status => print_json(&manager.status().await?),
        Command::Restore(name) => {
            let report = manager.restore(&name).await?;
            print_json(&report)
        }
        Command::History(limit) => print_json(&manager.health_history(limit).await?),
        Command::Run => bail!("--run is handled by run_until_interrupted"),
    }
}
