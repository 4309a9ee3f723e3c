//! Registry behaviour against real servers

use appdex_common::{Error, LaunchConfig};
use appdex_launcher::{LaunchSpec, Registry};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;

fn in_path(bin: &str) -> bool {
    Command::new("sh")
        .arg("-lc")
        .arg(format!("command -v {bin} >/dev/null 2>&1"))
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn registry(tmp: &TempDir, port_span: u16) -> Registry {
    Registry::new(
        LaunchConfig {
            port_base: free_port(),
            port_span,
            ready_timeout_secs: 10,
            stop_grace_secs: 2,
            ..Default::default()
        },
        tmp.path().join("apps-debris"),
    )
}

fn page(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "<html><body>hello</body></html>").unwrap();
    path
}

/// Python app that serves on `$PORT`
fn python_app(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(
        &path,
        "import http.server, os\n\
         server = http.server.HTTPServer(('127.0.0.1', int(os.environ['PORT'])), \
         http.server.SimpleHTTPRequestHandler)\n\
         server.serve_forever()\n",
    )
    .unwrap();
    path
}

/// Python app that ignores `$PORT` and always binds `port`
fn fixed_port_app(dir: &Path, name: &str, port: u16) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(
        &path,
        format!(
            "import http.server\n\
             server = http.server.HTTPServer(('127.0.0.1', {}), \
             http.server.SimpleHTTPRequestHandler)\n\
             server.serve_forever()\n",
            port
        ),
    )
    .unwrap();
    path
}

async fn accepting(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

#[tokio::test]
async fn test_acquire_twice_reuses() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp, 20);
    let spec = LaunchSpec::html(page(tmp.path(), "index.html"));

    let first = registry.acquire(&spec).await.unwrap();
    let second = registry.acquire(&spec).await.unwrap();

    assert_eq!(first.port(), second.port());
    assert!(first.started());
    assert!(!second.started());
    assert_eq!(registry.launch_count(), 1);
    assert_eq!(registry.list()[0].refs, 2);
    assert!(accepting(first.port()).await);
}

#[tokio::test]
async fn test_concurrent_acquires_start_once() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp, 20);
    let spec = LaunchSpec::html(page(tmp.path(), "index.html"));

    let leases = futures::future::join_all((0..16).map(|_| {
        let registry = registry.clone();
        let spec = spec.clone();
        tokio::spawn(async move { registry.acquire(&spec).await })
    }))
    .await;

    let ports: Vec<u16> = leases
        .iter()
        .map(|joined| joined.as_ref().unwrap().as_ref().unwrap().port())
        .collect();
    assert!(ports.iter().all(|port| *port == ports[0]));
    assert_eq!(registry.launch_count(), 1);
    assert_eq!(registry.list().len(), 1);
}

#[tokio::test]
async fn test_distinct_keys_distinct_ports() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp, 20);

    let a = registry.acquire(&LaunchSpec::html(page(tmp.path(), "a.html"))).await.unwrap();
    let b = registry.acquire(&LaunchSpec::html(page(tmp.path(), "b.html"))).await.unwrap();
    assert_ne!(a.port(), b.port());
    assert_eq!(registry.held_ports().len(), 2);
}

#[tokio::test]
async fn test_stop_all_frees_everything() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp, 20);
    let a = LaunchSpec::html(page(tmp.path(), "a.html"));
    let b = LaunchSpec::html(page(tmp.path(), "b.html"));

    let lease_a = registry.acquire(&a).await.unwrap();
    let port_a = lease_a.port();
    let lease_b = registry.acquire(&b).await.unwrap();
    drop(lease_b);

    assert_eq!(registry.stop_all().await, 2);
    assert!(registry.list().is_empty());
    assert!(registry.held_ports().is_empty());
    assert!(!accepting(port_a).await);
    drop(lease_a);

    let again = registry.acquire(&a).await.unwrap();
    assert!(again.started());
    assert!(accepting(again.port()).await);
    assert_eq!(registry.launch_count(), 3);
}

#[tokio::test]
async fn test_port_exhaustion() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp, 1);
    let _taken = std::net::TcpListener::bind(("127.0.0.1", registry.config().port_base)).unwrap();

    let err = registry
        .acquire(&LaunchSpec::python(tmp.path().join("app.py"), None))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PortExhausted { span: 1, .. }));
    assert_eq!(registry.launch_count(), 0);
    assert!(registry.list().is_empty());
    assert!(registry.held_ports().is_empty());
}

#[tokio::test]
async fn test_python_app_lifecycle() {
    if !in_path("python3") {
        eprintln!("skipping: python3 not installed");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp, 20);
    let spec = LaunchSpec::python(python_app(tmp.path(), "serve_port.py"), None);

    let lease = registry.acquire(&spec).await.unwrap();
    let port = lease.port();
    assert!(accepting(port).await);
    assert!(registry.list()[0].pid.is_some());
    assert!(tmp.path().join("apps-debris").is_dir());

    let again = registry.acquire(&spec).await.unwrap();
    assert_eq!(again.port(), port);
    assert_eq!(registry.launch_count(), 1);

    drop(lease);
    drop(again);
    assert_eq!(registry.stop_all().await, 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!accepting(port).await);
}

#[tokio::test]
async fn test_python_crash_is_launch_failure() {
    if !in_path("python3") {
        eprintln!("skipping: python3 not installed");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let script = tmp.path().join("crash.py");
    std::fs::write(&script, "raise SystemExit('boom on startup')\n").unwrap();
    let registry = registry(&tmp, 20);

    let err = registry
        .acquire(&LaunchSpec::python(&script, None))
        .await
        .unwrap_err();
    match err {
        Error::LaunchFailed { key, reason } => {
            assert_eq!(key, script);
            assert!(reason.contains("boom on startup"), "reason: {}", reason);
        }
        other => panic!("expected LaunchFailed, got {:?}", other),
    }
    assert!(registry.list().is_empty());
    assert!(registry.held_ports().is_empty());
}

#[tokio::test]
async fn test_dead_process_replaced_on_reuse() {
    if !in_path("python3") {
        eprintln!("skipping: python3 not installed");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp, 20);
    let spec = LaunchSpec::python(python_app(tmp.path(), "app.py"), None);

    let lease = registry.acquire(&spec).await.unwrap();
    let pid = registry.list()[0].pid.unwrap();
    drop(lease);

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let lease = registry.acquire(&spec).await.unwrap();
    assert!(lease.started());
    assert_eq!(registry.launch_count(), 2);
    assert_ne!(registry.list()[0].pid, Some(pid));
}

#[tokio::test]
async fn test_apps_sharing_declared_port_take_turns() {
    if !in_path("python3") {
        eprintln!("skipping: python3 not installed");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp, 20);
    let port = free_port();
    let a = LaunchSpec::python(fixed_port_app(tmp.path(), "a.py", port), Some(port));
    let b = LaunchSpec::python(fixed_port_app(tmp.path(), "b.py", port), Some(port));

    let lease_a = registry.acquire(&a).await.unwrap();
    assert_eq!(lease_a.port(), port);
    drop(lease_a);

    // The idle server for a.py gives the port up to b.py
    let lease_b = registry.acquire(&b).await.unwrap();
    assert!(lease_b.started());
    assert_eq!(lease_b.port(), port);
    let running = registry.list();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].key, b.key);
    drop(lease_b);

    let lease_a = registry.acquire(&a).await.unwrap();
    assert_eq!(lease_a.port(), port);
    assert_eq!(registry.launch_count(), 3);
    registry.stop_all().await;
}

#[tokio::test]
async fn test_declared_port_not_shadowed_by_static_server() {
    if !in_path("python3") {
        eprintln!("skipping: python3 not installed");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp, 20);
    let base = registry.config().port_base;

    let page_lease = registry
        .acquire(&LaunchSpec::html(page(tmp.path(), "index.html")))
        .await
        .unwrap();
    assert_ne!(page_lease.port(), base);

    let app = LaunchSpec::python(fixed_port_app(tmp.path(), "app.py", base), Some(base));
    let app_lease = registry.acquire(&app).await.unwrap();
    assert_eq!(app_lease.port(), base);
    assert!(accepting(base).await);
    assert_eq!(registry.list().len(), 2);
    registry.stop_all().await;
}

#[tokio::test]
async fn test_stop_all_cancels_pending_acquire() {
    if !in_path("python3") {
        eprintln!("skipping: python3 not installed");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let script = tmp.path().join("never_ready.py");
    std::fs::write(&script, "import time\ntime.sleep(60)\n").unwrap();
    let registry = Registry::new(
        LaunchConfig {
            port_base: free_port(),
            port_span: 20,
            ready_timeout_secs: 30,
            stop_grace_secs: 1,
            ..Default::default()
        },
        tmp.path().join("apps-debris"),
    );

    let pending = {
        let registry = registry.clone();
        let spec = LaunchSpec::python(&script, None);
        tokio::spawn(async move { registry.acquire(&spec).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(registry.stop_all().await, 0);
    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(registry.held_ports().is_empty());
    assert!(registry.list().is_empty());
}
