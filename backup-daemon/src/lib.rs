//! Backup Daemon Library
//!
//! Content-hash change detection, full and incremental snapshots, a JSON
//! metadata ledger, retention and a scheduler loop with cloud sync.

pub mod archive;
pub mod cloud;
pub mod config;
pub mod daemon;
pub mod detector;
pub mod engine;
pub mod fs;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use engine::BackupEngine;
pub use scheduler::{Scheduler, SchedulerState};
pub use utils::errors::{BackupError, Result};
