//! Supervisor for a locally running gateway process: spawning and teardown,
//! crash-safe backup and restore of its state directory, config migrations
//! and credential storage.

pub mod archive;
pub mod auth_profiles;
pub mod backup;
pub mod error;
pub mod fsutil;
pub mod host;
pub mod logging;
pub mod migrations;
pub mod platform;
pub mod settings;
pub mod state;
pub mod supervisor;

pub use error::{Result, WardenError};
