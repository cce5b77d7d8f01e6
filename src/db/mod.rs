// src/db/mod.rs
// Connection plumbing: settings, pool, owned tables

pub mod header;
pub mod health_log;
pub mod pool;
pub mod schema;
pub mod settings;

pub use health_log::HealthCheckRecord;
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use settings::{DurabilitySettings, SettingWarning, apply_settings};
