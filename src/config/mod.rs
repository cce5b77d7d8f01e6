// src/config/mod.rs
// Configuration: defaults, TOML file, environment overrides

pub mod env;
pub mod file;

pub use env::{ConfigValidation, EnvOverrides};
pub use file::ManagerConfig;
