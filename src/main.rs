// src/main.rs
// Keepsafe - durable SQLite pool with backups, integrity checks and recovery

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env files (global first, then current directory)
    if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_path(home.join(".keepsafe/.env"));
    }
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let command = cli.command()?;

    // JSON goes to stdout, so logs stay quiet on stderr unless asked for
    let log_level = match command {
        _ if cli.verbose => Level::INFO,
        Command::Run => Level::INFO,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.manager_config()?;
    match command {
        Command::Run => cli::run_until_interrupted(config).await,
        command => cli::run_command(config, command).await,
    }
}
