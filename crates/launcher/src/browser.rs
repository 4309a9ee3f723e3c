//! Headless browser driver

use appdex_common::{CaptureConfig, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Chromium-family binaries tried when none is configured
pub const BROWSER_CANDIDATES: [&str; 4] = [
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

/// Something that can render a URL to a PNG
#[async_trait]
pub trait Browser: Send + Sync {
    async fn screenshot(&self, url: &str) -> Result<Bytes>;
}

/// One-shot `--headless --screenshot` runs of a Chromium-family browser
#[derive(Debug, Clone)]
pub struct HeadlessChrome {
    binary: PathBuf,
    width: u32,
    height: u32,
    page_timeout: Duration,
}

impl HeadlessChrome {
    pub fn new(binary: impl Into<PathBuf>, config: &CaptureConfig) -> Self {
        Self {
            binary: binary.into(),
            width: config.width,
            height: config.height,
            page_timeout: config.page_timeout(),
        }
    }

    /// Use the configured binary, or the first candidate found on `PATH`
    pub fn detect(config: &CaptureConfig) -> Result<Self> {
        if let Some(binary) = &config.browser_binary {
            return Ok(Self::new(binary, config));
        }
        BROWSER_CANDIDATES
            .iter()
            .find_map(|name| find_in_path(name))
            .map(|binary| Self::new(binary, config))
            .ok_or(Error::BrowserNotFound)
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, profile_dir: &Path, shot: &Path, url: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--headless=new")
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--hide-scrollbars")
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg(format!("--window-size={},{}", self.width, self.height))
            .arg(format!("--screenshot={}", shot.display()))
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Browser for HeadlessChrome {
    async fn screenshot(&self, url: &str) -> Result<Bytes> {
        let workdir = tempfile::TempDir::new()?;
        let shot = workdir.path().join("shot.png");
        let profile = workdir.path().join("profile");

        debug!("Capturing {} with {}", url, self.binary.display());
        let child = self
            .command(&profile, &shot, url)
            .spawn()
            .map_err(|e| Error::Capture(format!("failed to start {}: {}", self.binary.display(), e)))?;

        // Dropping the child on timeout kills the browser
        let output = match timeout(self.page_timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::CaptureTimeout {
                    url: url.to_string(),
                    seconds: self.page_timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(Error::Capture(format!(
                "browser exited with {}: {}",
                output.status, last
            )));
        }

        match tokio::fs::read(&shot).await {
            Ok(png) if !png.is_empty() => Ok(Bytes::from(png)),
            _ => Err(Error::Capture(format!("no screenshot produced for {}", url))),
        }
    }
}

/// Stand-in used when no browser is installed; every capture fails
#[derive(Debug, Clone, Copy, Default)]
pub struct Unavailable;

#[async_trait]
impl Browser for Unavailable {
    async fn screenshot(&self, _url: &str) -> Result<Bytes> {
        Err(Error::BrowserNotFound)
    }
}

/// The detected headless browser, or [`Unavailable`] with a warning
pub fn system_browser(config: &CaptureConfig) -> Arc<dyn Browser> {
    match HeadlessChrome::detect(config) {
        Ok(chrome) => {
            info!("Using headless browser {}", chrome.binary().display());
            Arc::new(chrome)
        }
        Err(e) => {
            warn!("{}; thumbnails will not be captured", e);
            Arc::new(Unavailable)
        }
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
