//! Python app processes

use appdex_common::{Error, LaunchConfig, Result};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Variables inherited from our environment; everything else is cleared
const PASSTHROUGH_ENV: [&str; 4] = ["PATH", "PYTHONPATH", "HOME", "USER"];

const LOG_TAIL_BYTES: u64 = 2048;

/// A running Python app
pub(crate) struct AppProcess {
    child: Child,
    log_path: PathBuf,
}

impl AppProcess {
    /// Start `script` with `PORT=<port>` and wait until it accepts connections
    pub(crate) async fn spawn(
        config: &LaunchConfig,
        scratch_dir: &Path,
        script: &Path,
        port: u16,
    ) -> Result<Self> {
        std::fs::create_dir_all(scratch_dir)?;
        let log_path = scratch_dir.join(log_file_name(script, port));
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let mut cmd = Command::new(&config.python_binary);
        cmd.arg(script).current_dir(scratch_dir).env_clear();
        for var in PASSTHROUGH_ENV {
            if let Some(value) = std::env::var_os(var) {
                cmd.env(var, value);
            }
        }
        cmd.env("PORT", port.to_string())
            .env("FLASK_DEBUG", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| Error::LaunchFailed {
            key: script.to_path_buf(),
            reason: format!("failed to spawn {}: {}", config.python_binary, e),
        })?;

        info!(
            "Started {} on port {} (pid {:?})",
            script.display(),
            port,
            child.id()
        );

        let mut process = Self { child, log_path };
        if let Err(reason) = wait_ready(&mut process.child, port, config.ready_timeout()).await {
            let _ = process.child.kill().await;
            let tail = log_tail(&process.log_path);
            return Err(Error::LaunchFailed {
                key: script.to_path_buf(),
                reason: if tail.is_empty() {
                    reason
                } else {
                    format!("{}; log tail:\n{}", reason, tail)
                },
            });
        }

        Ok(process)
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the child is still running; reaps it if not
    pub(crate) fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, wait out the grace period, then kill
    pub(crate) async fn stop(mut self, grace: Duration) {
        if let Some(pid) = self.child.id() {
            debug!("Sending SIGTERM to {}", pid);
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        match timeout(grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Process ignored SIGTERM for {:?}, killing", grace);
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Poll until `127.0.0.1:<port>` accepts a connection or the budget runs out
pub(crate) async fn wait_ready(
    child: &mut Child,
    port: u16,
    budget: Duration,
) -> std::result::Result<(), String> {
    let deadline = Instant::now() + budget;
    let mut delay = Duration::from_millis(100);

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Err(format!("exited during startup with {}", status)),
            Ok(None) => {}
            Err(e) => return Err(format!("could not poll process: {}", e)),
        }

        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(format!("not accepting connections on port {} after {:?}", port, budget));
        }
        sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(Duration::from_secs(1));
    }
}

fn log_file_name(script: &Path, port: u16) -> String {
    let stem = script
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "app".to_string());
    format!("{}-{}.log", stem, port)
}

/// Last few lines of a log file, for error reports
fn log_tail(path: &Path) -> String {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return String::new(),
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if file.seek(SeekFrom::Start(len.saturating_sub(LOG_TAIL_BYTES))).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name(Path::new("/a/todo_app.py"), 5001), "todo_app-5001.log");
    }

    #[test]
    fn test_log_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.log");
        let long = format!("{}\nTraceback: boom\n", "x".repeat(5000));
        std::fs::write(&path, long).unwrap();

        let tail = log_tail(&path);
        assert!(tail.len() <= LOG_TAIL_BYTES as usize);
        assert!(tail.ends_with("Traceback: boom"));
        assert_eq!(log_tail(&tmp.path().join("missing.log")), "");
    }

    #[tokio::test]
    async fn test_wait_ready_reports_early_exit() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("exit 3")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let err = wait_ready(&mut child, 1, Duration::from_secs(5)).await.unwrap_err();
        assert!(err.contains("exited"));
    }
}
