//! Appdex configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, loaded from `~/.appdex/config.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppdexConfig {
    /// Store directory (database, thumbnails, scratch space)
    pub store_path: PathBuf,

    /// Web API configuration
    pub web: WebConfig,

    /// Scan configuration
    pub scan: ScanConfig,

    /// App launching configuration
    pub launch: LaunchConfig,

    /// Screenshot configuration
    pub capture: CaptureConfig,
}

impl Default for AppdexConfig {
    fn default() -> Self {
        Self {
            store_path: crate::default_store_path(),
            web: WebConfig::default(),
            scan: ScanConfig::default(),
            launch: LaunchConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

/// Web API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Listen address
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5055".to_string(),
        }
    }
}

/// Scan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Path fragments pruned in addition to the built-in exclusions
    pub extra_excludes: Vec<String>,
}

/// Process/port registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Interpreter used to run Python apps
    pub python_binary: String,

    /// First port of the managed range
    pub port_base: u16,

    /// Number of ports in the managed range
    pub port_span: u16,

    /// How long a freshly started app has to accept connections
    pub ready_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace_secs: u64,

    /// How long an app waits for a busy server to give up its declared port
    pub port_wait_secs: u64,

    /// Working directory for launched apps (defaults to `<store>/apps-debris`)
    pub scratch_dir: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            python_binary: "python3".to_string(),
            port_base: 5000,
            port_span: 200,
            ready_timeout_secs: 8,
            stop_grace_secs: 5,
            port_wait_secs: 60,
            scratch_dir: None,
        }
    }
}

impl LaunchConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn port_wait(&self) -> Duration {
        Duration::from_secs(self.port_wait_secs)
    }
}

/// Screenshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Chromium-family binary; auto-detected when unset
    pub browser_binary: Option<String>,

    /// Viewport width
    pub width: u32,

    /// Viewport height
    pub height: u32,

    /// Page-load budget per attempt
    pub page_timeout_secs: u64,

    /// Extra attempts after a page-load timeout
    pub page_retries: u32,

    /// Number of background capture workers
    pub workers: usize,

    /// Stop servers that were started only for a capture
    pub ephemeral: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            browser_binary: None,
            width: 1024,
            height: 768,
            page_timeout_secs: 20,
            page_retries: 1,
            workers: 2,
            ephemeral: false,
        }
    }
}

impl CaptureConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }
}

impl AppdexConfig {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the registry and workers cannot operate with
    pub fn validate(&self) -> Result<()> {
        let launch = &self.launch;
        if launch.port_span == 0 {
            return Err(Error::InvalidConfig("launch.port_span must be > 0".to_string()));
        }
        if u32::from(launch.port_base) + u32::from(launch.port_span) > u32::from(u16::MAX) + 1 {
            return Err(Error::InvalidConfig(format!(
                "launch port range {}+{} exceeds 65535",
                launch.port_base, launch.port_span
            )));
        }
        if self.capture.workers == 0 {
            return Err(Error::InvalidConfig("capture.workers must be > 0".to_string()));
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("index.db")
    }

    /// Get the thumbnails directory
    pub fn thumbnails_dir(&self) -> PathBuf {
        self.store_path.join("thumbnails")
    }

    /// Get the working directory for launched apps
    pub fn scratch_dir(&self) -> PathBuf {
        self.launch
            .scratch_dir
            .clone()
            .unwrap_or_else(|| self.store_path.join("apps-debris"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = AppdexConfig::load(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(config.launch.port_base, 5000);
        assert_eq!(config.capture.page_retries, 1);
        assert_eq!(config.web.listen, "127.0.0.1:5055");
    }

    #[test]
    fn test_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "store_path = \"/tmp/appdex\"\n[launch]\nport_base = 7000\n",
        )
        .unwrap();

        let config = AppdexConfig::load(&path).unwrap();
        assert_eq!(config.launch.port_base, 7000);
        assert_eq!(config.launch.port_span, 200);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/appdex/index.db"));
        assert_eq!(config.scratch_dir(), PathBuf::from("/tmp/appdex/apps-debris"));
    }

    #[test]
    fn test_save_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        let mut config = AppdexConfig::default();
        config.scan.extra_excludes = vec!["build".to_string()];
        config.save(&path).unwrap();

        let loaded = AppdexConfig::load(&path).unwrap();
        assert_eq!(loaded.scan.extra_excludes, vec!["build".to_string()]);
    }

    #[test]
    fn test_rejects_overflowing_range() {
        let mut config = AppdexConfig::default();
        config.launch.port_base = 65500;
        config.launch.port_span = 100;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
