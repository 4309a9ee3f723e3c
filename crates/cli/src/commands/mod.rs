//! CLI command implementations

pub mod capture;
pub mod config;
pub mod items;
pub mod scan;

use anyhow::{Context as _, Result};
use appdex_common::{AppdexConfig, Database};
use std::path::Path;

/// Loaded configuration plus the opened index
pub struct Context {
    pub config: AppdexConfig,
    pub db: Database,
}

impl Context {
    pub fn open(config_path: &Path) -> Result<Self> {
        let config = AppdexConfig::load(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        let db = Database::open(config.db_path())
            .with_context(|| format!("opening {}", config.db_path().display()))?;
        Ok(Self { config, db })
    }
}
