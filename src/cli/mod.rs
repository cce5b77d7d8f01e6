// src/cli/mod.rs
// CLI module for keepsafe commands

use anyhow::{Result, bail};
use clap::Parser;
use keepsafe::ManagerConfig;
use std::path::PathBuf;

pub mod commands;
pub mod run;

pub use commands::run_command;
pub use run::run_until_interrupted;

/// Rows shown by `--history` without an explicit count
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "keepsafe")]
#[command(about = "Durable SQLite pool with scheduled backups, integrity checks and recovery")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.keepsafe/config.toml)
    #[arg(long, global = true, env = "KEEPSAFE_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Live database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Backup directory
    #[arg(long, global = true, value_name = "PATH")]
    pub backup_dir: Option<PathBuf>,

    /// Log at info level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Create a verified backup, optionally with a name
    #[arg(long, value_name = "NAME", num_args = 0..=1)]
    pub backup: Option<Option<String>>,

    /// Run a full integrity check
    #[arg(long)]
    pub integrity: bool,

    /// VACUUM when fragmentation is above the threshold
    #[arg(long)]
    pub vacuum: bool,

    /// With --vacuum: ignore the fragmentation threshold
    #[arg(long, requires = "vacuum")]
    pub force: bool,

    /// List restorable backups, newest first
    #[arg(long)]
    pub list_backups: bool,

    /// Show pool, backup and health status
    #[arg(long)]
    pub status: bool,

    /// Replace the live database with the named backup
    #[arg(long, value_name = "NAME")]
    pub restore: Option<String>,

    /// Show recent health checks
    #[arg(long, value_name = "N", num_args = 0..=1)]
    pub history: Option<Option<usize>>,

    /// Run the background workers until Ctrl-C
    #[arg(long)]
    pub run: bool,
}

/// The single action requested on the command line
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Backup(Option<String>),
    Integrity,
    Vacuum { force: bool },
    ListBackups,
    Status,
    Restore(String),
    History(usize),
    Run,
}

impl Cli {
    /// Resolve the flags to one command. No flag means `--status`.
    pub fn command(&self) -> Result<Command> {
        let mut chosen = Vec::new();
        if let Some(name) = &self.backup {
            chosen.push(Command::Backup(name.clone()));
        }
        if self.integrity {
            chosen.push(Command::Integrity);
        }
        if self.vacuum {
            chosen.push(Command::Vacuum { force: self.force });
        }
        if self.list_backups {
            chosen.push(Command::ListBackups);
        }
        if self.status {
            chosen.push(Command::Status);
        }
        if let Some(name) = &self.restore {
            chosen.push(Command::Restore(name.clone()));
        }
        if let Some(limit) = self.history {
            chosen.push(Command::History(limit.unwrap_or(DEFAULT_HISTORY_LIMIT)));
        }
        if self.run {
            chosen.push(Command::Run);
        }

        match chosen.len() {
            0 => Ok(Command::Status),
            1 => Ok(chosen.remove(0)),
            n => bail!("expected one command flag, got {n}"),
        }
    }

    /// Config file, then KEEPSAFE_* environment, then command-line paths.
    pub fn manager_config(&self) -> Result<ManagerConfig> {
        let mut config = ManagerConfig::load(self.config.as_deref())?;
        config.apply_env();
        if let Some(db) = &self.db {
            config.db_path = db.clone();
        }
        if let Some(dir) = &self.backup_dir {
            config.backup_dir = Some(dir.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("keepsafe").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_optional_values() {
        assert_eq!(parse(&["--backup"]).command().unwrap(), Command::Backup(None));
        assert_eq!(
            parse(&["--backup", "nightly"]).command().unwrap(),
            Command::Backup(Some("nightly".to_string()))
        );
        assert_eq!(
            parse(&["--history"]).command().unwrap(),
            Command::History(DEFAULT_HISTORY_LIMIT)
        );
        assert_eq!(parse(&["--history", "3"]).command().unwrap(), Command::History(3));
    }

    #[test]
    fn test_no_flag_means_status() {
        assert_eq!(parse(&[]).command().unwrap(), Command::Status);
    }

    #[test]
    fn test_conflicting_commands_are_rejected() {
        assert!(parse(&["--integrity", "--list-backups"]).command().is_err());
    }

    #[test]
    fn test_force_requires_vacuum() {
        assert!(Cli::try_parse_from(["keepsafe", "--force"]).is_err());
        assert_eq!(
            parse(&["--vacuum", "--force"]).command().unwrap(),
            Command::Vacuum { force: true }
        );
    }

    #[test]
    fn test_path_flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("keepsafe.toml");
        std::fs::write(&config_path, "db_path = \"/from/file.db\"\nmax_connections = 3\n").unwrap();

        let cli = parse(&[
            "--config",
            config_path.to_str().unwrap(),
            "--db",
            "/from/flag.db",
            "--backup-dir",
            "/from/flag/backups",
        ]);
        let config = cli.manager_config().unwrap();
        assert_eq!(config.db_path, PathBuf::from("/from/flag.db"));
        assert_eq!(config.backup_dir, Some(PathBuf::from("/from/flag/backups")));
        assert_eq!(config.max_connections, 3);
    }
}
