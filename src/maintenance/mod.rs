// src/maintenance/mod.rs
// Backup, restore, integrity and vacuum engines

pub mod backup;
pub mod integrity;
pub mod restore;
pub mod vacuum;

pub use backup::{BackupRecord, create_backup, list_backups};
pub use integrity::{HealthStatus, IntegrityResult, check_integrity};
pub use restore::{RestoreContext, RestoreReport, restore_backup};
pub use vacuum::{VacuumResult, vacuum};
