//! Appdex Common Library
//!
//! Shared types, configuration and the SQLite item index.

pub mod config;
pub mod db;
pub mod error;
pub mod types;

pub use config::{AppdexConfig, CaptureConfig, LaunchConfig, ScanConfig, WebConfig};
pub use db::{Database, UpsertOutcome};
pub use error::{Error, Result};
pub use types::*;

/// Appdex version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".appdex")
}

/// Default configuration file
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
