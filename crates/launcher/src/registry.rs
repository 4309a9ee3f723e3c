//! Process/port registry
//!
//! One live server per key (script or HTML path), one key per port. Callers
//! hold a [`Lease`] while they use a server; dropping it releases the server
//! without stopping it, so the next request for the same key reuses it.

use crate::process::AppProcess;
use crate::static_server::StaticServer;
use appdex_common::{DiscoveredItem, Error, ItemKind, LaunchConfig, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub key: PathBuf,
    pub kind: ItemKind,
    /// Port the app itself listens on, if it declares one
    pub preferred_port: Option<u16>,
}

impl LaunchSpec {
    pub fn python(script: impl Into<PathBuf>, preferred_port: Option<u16>) -> Self {
        Self {
            key: script.into(),
            kind: ItemKind::PythonApp,
            preferred_port,
        }
    }

    pub fn html(file: impl Into<PathBuf>) -> Self {
        Self {
            key: file.into(),
            kind: ItemKind::StandaloneHtml,
            preferred_port: None,
        }
    }

    pub fn for_item(item: &DiscoveredItem) -> Self {
        match item.kind {
            ItemKind::PythonApp => Self::python(item.main_path.clone(), item.declared_port),
            ItemKind::StandaloneHtml => Self::html(item.main_path.clone()),
        }
    }
}

/// Snapshot of a live registry entry
#[derive(Debug, Clone, Serialize)]
pub struct ServerHandle {
    pub key: PathBuf,
    pub kind: ItemKind,
    pub port: u16,
    pub pid: Option<u32>,
    pub refs: usize,
    pub started_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl ServerHandle {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }
}

enum Running {
    Process(AppProcess),
    Static(StaticServer),
}

impl Running {
    fn is_alive(&mut self) -> bool {
        match self {
            Running::Process(p) => p.is_alive(),
            Running::Static(s) => s.is_alive(),
        }
    }

    fn pid(&self) -> Option<u32> {
        match self {
            Running::Process(p) => p.pid(),
            Running::Static(_) => None,
        }
    }

    async fn stop(self, grace: Duration) {
        match self {
            Running::Process(p) => p.stop(grace).await,
            Running::Static(s) => s.stop(grace).await,
        }
    }
}

/// Per-key entry. `gate` serializes start/stop for the key.
struct Slot {
    gate: tokio::sync::Mutex<Option<(u16, Running)>>,
    refs: AtomicUsize,
    info: Mutex<Option<ServerHandle>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(None),
            refs: AtomicUsize::new(0),
            info: Mutex::new(None),
        }
    }

    fn touch(&self) {
        if let Some(info) = self.info.lock().as_mut() {
            info.last_used = Utc::now();
        }
    }
}

#[derive(Default)]
struct Table {
    slots: HashMap<PathBuf, Arc<Slot>>,
    /// Ports held by live or starting servers, with the key holding each
    ports: BTreeMap<u16, PathBuf>,
}

/// A port reserved in the table. Static servers also get the bound socket.
struct Reserved {
    port: u16,
    listener: Option<std::net::TcpListener>,
}

struct Inner {
    config: LaunchConfig,
    scratch_dir: PathBuf,
    table: Mutex<Table>,
    cancel: Mutex<CancellationToken>,
    launches: AtomicUsize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Static servers watch child tokens; app processes are killed on drop
        self.cancel.lock().cancel();
    }
}

/// Shared registry of launched servers
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

/// In-use token for a live server; dropping it releases the server
pub struct Lease {
    slot: Arc<Slot>,
    key: PathBuf,
    port: u16,
    started: bool,
}

impl Lease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn key(&self) -> &Path {
        &self.key
    }

    /// Whether this acquire started the server (as opposed to reusing it)
    pub fn started(&self) -> bool {
        self.started
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.slot.refs.fetch_sub(1, Ordering::SeqCst);
        self.slot.touch();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("port", &self.port)
            .field("started", &self.started)
            .finish()
    }
}

impl Registry {
    pub fn new(config: LaunchConfig, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                scratch_dir: scratch_dir.into(),
                table: Mutex::new(Table::default()),
                cancel: Mutex::new(CancellationToken::new()),
                launches: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.inner.config
    }

    /// Get a live server for `spec.key`, starting one if needed
    pub async fn acquire(&self, spec: &LaunchSpec) -> Result<Lease> {
        let cancel = self.inner.cancel.lock().clone();

        loop {
            let slot = {
                let mut table = self.inner.table.lock();
                table
                    .slots
                    .entry(spec.key.clone())
                    .or_insert_with(|| Arc::new(Slot::new()))
                    .clone()
            };

            let mut gate = tokio::select! {
                gate = slot.gate.lock() => gate,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };

            // Stopped and replaced while we waited
            if !self.is_current(&spec.key, &slot) {
                continue;
            }

            if let Some((port, running)) = gate.as_mut() {
                let port = *port;
                if running.is_alive() {
                    slot.refs.fetch_add(1, Ordering::SeqCst);
                    slot.touch();
                    debug!("Reusing {} on port {}", spec.key.display(), port);
                    return Ok(Lease {
                        slot: slot.clone(),
                        key: spec.key.clone(),
                        port,
                        started: false,
                    });
                }

                warn!("Server for {} died, restarting", spec.key.display());
                if let Some((_, dead)) = gate.take() {
                    dead.stop(Duration::ZERO).await;
                }
                *slot.info.lock() = None;
                self.free_port(port);
            }

            let reserved = match self.reserve(spec, &cancel).await {
                Ok(reserved) => reserved,
                Err(e) => {
                    self.forget_slot(&spec.key, &slot);
                    return Err(e);
                }
            };
            let port = reserved.port;
            self.inner.launches.fetch_add(1, Ordering::SeqCst);

            let started = tokio::select! {
                result = self.start(spec, reserved, &cancel) => result,
                _ = cancel.cancelled() => Err(Error::Cancelled),
            };

            let running = match started {
                Ok(running) => running,
                Err(e) => {
                    self.free_port(port);
                    self.forget_slot(&spec.key, &slot);
                    return Err(e);
                }
            };

            let now = Utc::now();
            *slot.info.lock() = Some(ServerHandle {
                key: spec.key.clone(),
                kind: spec.kind,
                port,
                pid: running.pid(),
                refs: 0,
                started_at: now,
                last_used: now,
            });
            *gate = Some((port, running));
            slot.refs.fetch_add(1, Ordering::SeqCst);

            info!("Launched {} on port {}", spec.key.display(), port);
            return Ok(Lease {
                slot: slot.clone(),
                key: spec.key.clone(),
                port,
                started: true,
            });
        }
    }

    /// Give a lease back; the server stays warm
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Stop the server for `key`. Returns whether one was running.
    pub async fn stop(&self, key: &Path) -> Result<bool> {
        let slot = self.inner.table.lock().slots.remove(key);
        match slot {
            Some(slot) => Ok(self.stop_slot(&slot).await),
            None => Ok(false),
        }
    }

    /// Stop the server for `key` only if no lease holds it
    pub async fn stop_idle(&self, key: &Path) -> Result<bool> {
        let Some(slot) = self.inner.table.lock().slots.get(key).cloned() else {
            return Ok(false);
        };

        // Leases are only handed out under the gate, so the count is stable here
        let mut gate = slot.gate.lock().await;
        if slot.refs.load(Ordering::SeqCst) > 0 || !self.is_current(key, &slot) {
            return Ok(false);
        }
        self.inner.table.lock().slots.remove(key);
        Ok(self.stop_locked(&slot, &mut gate).await)
    }

    /// Interrupt in-flight acquires and stop every server. Returns how many were running.
    pub async fn stop_all(&self) -> usize {
        {
            let mut cancel = self.inner.cancel.lock();
            cancel.cancel();
            *cancel = CancellationToken::new();
        }

        let slots: Vec<Arc<Slot>> = {
            let mut table = self.inner.table.lock();
            table.slots.drain().map(|(_, slot)| slot).collect()
        };

        let stopped = futures::future::join_all(slots.iter().map(|slot| self.stop_slot(slot)))
            .await
            .into_iter()
            .filter(|stopped| *stopped)
            .count();

        info!("Stopped {} running servers", stopped);
        stopped
    }

    /// Live servers, ordered by port
    pub fn list(&self) -> Vec<ServerHandle> {
        let table = self.inner.table.lock();
        let mut handles: Vec<ServerHandle> = table
            .slots
            .values()
            .filter_map(|slot| {
                let mut handle = slot.info.lock().clone()?;
                handle.refs = slot.refs.load(Ordering::SeqCst);
                Some(handle)
            })
            .collect();
        handles.sort_by_key(|h| h.port);
        handles
    }

    /// Ports currently held
    pub fn held_ports(&self) -> Vec<u16> {
        self.inner.table.lock().ports.keys().copied().collect()
    }

    /// Number of server starts attempted since creation
    pub fn launch_count(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }

    fn is_current(&self, key: &Path, slot: &Arc<Slot>) -> bool {
        self.inner
            .table
            .lock()
            .slots
            .get(key)
            .map(|current| Arc::ptr_eq(current, slot))
            .unwrap_or(false)
    }

    /// Drop a slot left empty by a failed launch
    fn forget_slot(&self, key: &Path, slot: &Arc<Slot>) {
        let mut table = self.inner.table.lock();
        if table
            .slots
            .get(key)
            .map(|current| Arc::ptr_eq(current, slot))
            .unwrap_or(false)
        {
            table.slots.remove(key);
        }
    }

    async fn stop_slot(&self, slot: &Slot) -> bool {
        let mut gate = slot.gate.lock().await;
        self.stop_locked(slot, &mut gate).await
    }

    async fn stop_locked(&self, slot: &Slot, gate: &mut Option<(u16, Running)>) -> bool {
        *slot.info.lock() = None;
        match gate.take() {
            Some((port, running)) => {
                running.stop(self.inner.config.stop_grace()).await;
                self.free_port(port);
                debug!("Freed port {}", port);
                true
            }
            None => false,
        }
    }

    async fn start(
        &self,
        spec: &LaunchSpec,
        reserved: Reserved,
        cancel: &CancellationToken,
    ) -> Result<Running> {
        match spec.kind {
            ItemKind::PythonApp => {
                let process = AppProcess::spawn(
                    &self.inner.config,
                    &self.inner.scratch_dir,
                    &spec.key,
                    reserved.port,
                )
                .await?;
                Ok(Running::Process(process))
            }
            ItemKind::StandaloneHtml => {
                let listener = reserved.listener.ok_or_else(|| {
                    Error::Internal(format!("no socket reserved for {}", spec.key.display()))
                })?;
                let server = StaticServer::start(&spec.key, listener, cancel.child_token()).await?;
                Ok(Running::Static(server))
            }
        }
    }

    /// Reserve the port `spec` will be started on
    async fn reserve(&self, spec: &LaunchSpec, cancel: &CancellationToken) -> Result<Reserved> {
        let port = match (spec.kind, spec.preferred_port) {
            (ItemKind::StandaloneHtml, _) => return self.reserve_ephemeral(&spec.key),
            (ItemKind::PythonApp, Some(declared)) => {
                self.claim_declared(&spec.key, declared, cancel).await?
            }
            (ItemKind::PythonApp, None) => self.allocate_port(&spec.key, None)?,
        };
        Ok(Reserved {
            port,
            listener: None,
        })
    }

    /// Static servers bind an OS-assigned port so they never sit on a port an
    /// app may declare.
    fn reserve_ephemeral(&self, key: &Path) -> Result<Reserved> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();
        self.inner
            .table
            .lock()
            .ports
            .insert(port, key.to_path_buf());
        Ok(Reserved {
            port,
            listener: Some(listener),
        })
    }

    /// Apps usually ignore `$PORT` and bind the port they declare, so a
    /// declared port held by another server is taken over: an idle holder is
    /// stopped, a busy one is waited for up to `port_wait`.
    async fn claim_declared(
        &self,
        key: &Path,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<u16> {
        let deadline = Instant::now() + self.inner.config.port_wait();

        loop {
            let holder = self.inner.table.lock().ports.get(&port).cloned();
            let Some(holder) = holder else {
                return self.allocate_port(key, Some(port));
            };

            // An older server for this same key is still shutting down
            if holder.as_path() != key && self.stop_idle(&holder).await? {
                info!(
                    "Stopped {} to hand port {} to {}",
                    holder.display(),
                    port,
                    key.display()
                );
                continue;
            }

            if Instant::now() >= deadline {
                return Err(Error::PortBusy { port, holder });
            }
            debug!("Port {} busy with {}, waiting", port, holder.display());
            tokio::select! {
                _ = tokio::time::sleep(PORT_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Reserve the preferred port if free, else the first free port in range
    fn allocate_port(&self, key: &Path, preferred: Option<u16>) -> Result<u16> {
        let config = &self.inner.config;
        let mut table = self.inner.table.lock();

        if let Some(port) = preferred {
            if !table.ports.contains_key(&port) && is_bindable(port) {
                table.ports.insert(port, key.to_path_buf());
                return Ok(port);
            }
        }

        let base = u32::from(config.port_base);
        let end = (base + u32::from(config.port_span)).min(u32::from(u16::MAX) + 1);
        for candidate in base..end {
            let port = candidate as u16;
            if !table.ports.contains_key(&port) && is_bindable(port) {
                table.ports.insert(port, key.to_path_buf());
                return Ok(port);
            }
        }

        Err(Error::PortExhausted {
            base: config.port_base,
            span: config.port_span,
        })
    }

    fn free_port(&self, port: u16) {
        self.inner.table.lock().ports.remove(&port);
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.inner.table.lock().slots.len()
    }
}

fn is_bindable(port: u16) -> bool {
    port != 0 && std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(port_base: u16, port_span: u16) -> LaunchConfig {
        LaunchConfig {
            port_base,
            port_span,
            stop_grace_secs: 1,
            ..Default::default()
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn page(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, "<html></html>").unwrap();
        path
    }

    #[test]
    fn test_launch_spec_for_item() {
        let app = DiscoveredItem::python_app(
            PathBuf::from("/a/app.py"),
            None,
            5001,
            appdex_common::Framework::Flask,
        );
        assert_eq!(LaunchSpec::for_item(&app).preferred_port, Some(5001));

        let html = DiscoveredItem::standalone_html(PathBuf::from("/a/x.html"));
        let spec = LaunchSpec::for_item(&html);
        assert_eq!(spec.kind, ItemKind::StandaloneHtml);
        assert_eq!(spec.preferred_port, None);
    }

    #[tokio::test]
    async fn test_preferred_port_taken_falls_back() {
        let tmp = TempDir::new().unwrap();
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let base = free_port();

        let registry = Registry::new(config(base, 20), tmp.path());
        let port = registry
            .allocate_port(Path::new("/apps/a.py"), Some(busy_port))
            .unwrap();
        assert_ne!(port, busy_port);
        assert!(port >= base);
        assert_eq!(registry.held_ports(), vec![port]);
    }

    #[tokio::test]
    async fn test_stop_releases_key() {
        let tmp = TempDir::new().unwrap();
        let file = page(&tmp, "one.html");
        let registry = Registry::new(config(free_port(), 20), tmp.path());

        let lease = registry.acquire(&LaunchSpec::html(&file)).await.unwrap();
        assert!(lease.started());
        assert_eq!(registry.list()[0].refs, 1);
        registry.release(lease);
        assert_eq!(registry.list()[0].refs, 0);

        assert!(registry.stop(&file).await.unwrap());
        assert!(!registry.stop(&file).await.unwrap());
        assert!(registry.list().is_empty());
        assert!(registry.held_ports().is_empty());
    }

    #[tokio::test]
    async fn test_stop_idle_respects_leases() {
        let tmp = TempDir::new().unwrap();
        let file = page(&tmp, "busy.html");
        let registry = Registry::new(config(free_port(), 20), tmp.path());

        let lease = registry.acquire(&LaunchSpec::html(&file)).await.unwrap();
        assert!(!registry.stop_idle(&file).await.unwrap());
        drop(lease);
        assert!(registry.stop_idle(&file).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_launch_drops_slot() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(config(free_port(), 20), tmp.path());
        let missing = LaunchSpec::html(tmp.path().join("gone.html"));

        for _ in 0..3 {
            let err = registry.acquire(&missing).await.unwrap_err();
            assert!(matches!(err, Error::LaunchFailed { .. }));
        }
        assert_eq!(registry.slot_count(), 0);
        assert!(registry.held_ports().is_empty());
    }

    #[tokio::test]
    async fn test_static_server_stays_out_of_app_range() {
        let tmp = TempDir::new().unwrap();
        let base = free_port();
        let registry = Registry::new(config(base, 1), tmp.path());

        let lease = registry
            .acquire(&LaunchSpec::html(page(&tmp, "index.html")))
            .await
            .unwrap();
        assert_ne!(lease.port(), base);

        // The app range is still free for an app that declares its first port
        let port = registry
            .allocate_port(Path::new("/apps/app.py"), Some(base))
            .unwrap();
        assert_eq!(port, base);
    }

    #[tokio::test]
    async fn test_declared_port_taken_from_idle_holder() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(config(free_port(), 20), tmp.path());
        let file = page(&tmp, "holder.html");

        let lease = registry.acquire(&LaunchSpec::html(&file)).await.unwrap();
        let port = lease.port();
        drop(lease);

        let claimed = registry
            .claim_declared(Path::new("/apps/app.py"), port, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(claimed, port);
        assert!(registry.list().is_empty());
        assert_eq!(registry.held_ports(), vec![port]);
    }

    #[tokio::test]
    async fn test_declared_port_busy_holder() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(
            LaunchConfig {
                port_wait_secs: 0,
                ..config(free_port(), 20)
            },
            tmp.path(),
        );
        let file = page(&tmp, "busy.html");
        let lease = registry.acquire(&LaunchSpec::html(&file)).await.unwrap();

        let err = registry
            .claim_declared(Path::new("/apps/app.py"), lease.port(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::PortBusy { port, holder } => {
                assert_eq!(port, lease.port());
                assert_eq!(holder, file);
            }
            other => panic!("expected PortBusy, got {:?}", other),
        }
        // The holder keeps running
        assert_eq!(registry.list().len(), 1);
    }
}
