// src/lib.rs
// Keepsafe - durable SQLite connection pool with backup, integrity and recovery

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod background;
pub mod config;
pub mod db;
pub mod error;
pub mod maintenance;
pub mod manager;
pub mod utils;

pub use config::ManagerConfig;
pub use error::{KeepError, Result};
pub use manager::{Manager, ManagerState, ManagerStatus};
