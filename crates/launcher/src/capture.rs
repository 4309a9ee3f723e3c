//! Screenshot orchestration: launch (or reuse) a server, render it, release it

use crate::browser::Browser;
use crate::registry::{LaunchSpec, Registry};
use appdex_common::{CaptureConfig, DiscoveredItem, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Captures one frame of a discovered item
#[derive(Clone)]
pub struct Capturer {
    registry: Registry,
    browser: Arc<dyn Browser>,
    retries: u32,
    ephemeral: bool,
}

impl Capturer {
    pub fn new(registry: Registry, browser: Arc<dyn Browser>, config: &CaptureConfig) -> Self {
        Self {
            registry,
            browser,
            retries: config.page_retries,
            ephemeral: config.ephemeral,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// PNG bytes of the item's root page.
    ///
    /// The lease is released on every path out. In ephemeral mode a server
    /// that this call started is stopped again once nobody else holds it.
    pub async fn capture(&self, item: &DiscoveredItem) -> Result<Bytes> {
        let spec = LaunchSpec::for_item(item);
        let lease = self.registry.acquire(&spec).await?;
        let started = lease.started();

        let result = self.render(&lease.url()).await;
        self.registry.release(lease);

        if self.ephemeral && started {
            match self.registry.stop_idle(&spec.key).await {
                Ok(true) => debug!("Stopped ephemeral server for {}", spec.key.display()),
                Ok(false) => {}
                Err(e) => warn!("Failed to stop {}: {}", spec.key.display(), e),
            }
        }
        result
    }

    async fn render(&self, url: &str) -> Result<Bytes> {
        let mut attempt = 0;
        loop {
            match self.browser.screenshot(url).await {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!("{}; retrying ({}/{})", e, attempt, self.retries);
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appdex_common::{Error, LaunchConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Replays a scripted sequence of outcomes
    struct ScriptedBrowser {
        outcomes: Mutex<VecDeque<Result<Bytes>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBrowser {
        fn new(outcomes: Vec<Result<Bytes>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Browser for ScriptedBrowser {
        async fn screenshot(&self, url: &str) -> Result<Bytes> {
            self.calls.lock().push(url.to_string());
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Bytes::from_static(b"png")))
        }
    }

    fn timeout_err() -> Result<Bytes> {
        Err(Error::CaptureTimeout {
            url: "u".to_string(),
            seconds: 1,
        })
    }

    fn setup(tmp: &TempDir, browser: Arc<ScriptedBrowser>, ephemeral: bool) -> (Capturer, DiscoveredItem) {
        let base = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let registry = Registry::new(
            LaunchConfig {
                port_base: base,
                port_span: 20,
                ..Default::default()
            },
            tmp.path(),
        );
        let config = CaptureConfig {
            ephemeral,
            ..Default::default()
        };
        let page = tmp.path().join("page.html");
        std::fs::write(&page, "<html></html>").unwrap();
        (
            Capturer::new(registry, browser, &config),
            DiscoveredItem::standalone_html(page),
        )
    }

    #[tokio::test]
    async fn test_timeout_retried_once() {
        let tmp = TempDir::new().unwrap();
        let browser = ScriptedBrowser::new(vec![timeout_err(), Ok(Bytes::from_static(b"ok"))]);
        let (capturer, item) = setup(&tmp, browser.clone(), false);

        assert_eq!(capturer.capture(&item).await.unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(browser.calls.lock().len(), 2);
        // Kept warm for reuse
        assert_eq!(capturer.registry().list().len(), 1);
        assert_eq!(capturer.registry().list()[0].refs, 0);
    }

    #[tokio::test]
    async fn test_second_timeout_surfaces() {
        let tmp = TempDir::new().unwrap();
        let browser = ScriptedBrowser::new(vec![timeout_err(), timeout_err(), timeout_err()]);
        let (capturer, item) = setup(&tmp, browser.clone(), false);

        let err = capturer.capture(&item).await.unwrap_err();
        assert!(matches!(err, Error::CaptureTimeout { .. }));
        assert_eq!(browser.calls.lock().len(), 2);
        assert_eq!(capturer.registry().list()[0].refs, 0);
    }

    #[tokio::test]
    async fn test_non_transient_not_retried() {
        let tmp = TempDir::new().unwrap();
        let browser = ScriptedBrowser::new(vec![Err(Error::Capture("crashed".to_string()))]);
        let (capturer, item) = setup(&tmp, browser.clone(), false);

        assert!(capturer.capture(&item).await.is_err());
        assert_eq!(browser.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_skips_browser() {
        let tmp = TempDir::new().unwrap();
        let browser = ScriptedBrowser::new(vec![]);
        let (capturer, _) = setup(&tmp, browser.clone(), false);
        let missing = DiscoveredItem::standalone_html(tmp.path().join("gone.html"));

        let err = capturer.capture(&missing).await.unwrap_err();
        assert!(matches!(err, Error::LaunchFailed { .. }));
        assert!(browser.calls.lock().is_empty());
        assert!(capturer.registry().held_ports().is_empty());
    }

    #[tokio::test]
    async fn test_ephemeral_stops_server() {
        let tmp = TempDir::new().unwrap();
        let browser = ScriptedBrowser::new(vec![]);
        let (capturer, item) = setup(&tmp, browser, true);

        capturer.capture(&item).await.unwrap();
        assert!(capturer.registry().list().is_empty());
        assert!(capturer.registry().held_ports().is_empty());
    }
}
