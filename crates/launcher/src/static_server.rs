//! In-process static server for standalone HTML files

use appdex_common::{Error, Result};
use axum::Router;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, warn};

/// Serves one HTML file at `/` and its directory below it
pub(crate) struct StaticServer {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl StaticServer {
    /// Start serving on an already bound socket. Ready on return.
    pub(crate) async fn start(
        file: &Path,
        listener: std::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let launch_failed = |reason: String| Error::LaunchFailed {
            key: file.to_path_buf(),
            reason,
        };

        let dir = file
            .parent()
            .ok_or_else(|| launch_failed("file has no parent directory".to_string()))?;
        if !file.is_file() {
            return Err(launch_failed("file does not exist".to_string()));
        }

        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;

        let app = Router::new()
            .route_service("/", ServeFile::new(file))
            .fallback_service(ServeDir::new(dir));

        let token = shutdown.clone();
        let label = file.display().to_string();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!("Static server for {} failed: {}", label, e);
            }
        });

        debug!("Serving {} on port {}", file.display(), port);
        Ok(Self { shutdown, task })
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Graceful shutdown, aborted after `grace`
    pub(crate) async fn stop(self, grace: Duration) {
        self.shutdown.cancel();
        let abort = self.task.abort_handle();
        if timeout(grace, self.task).await.is_err() {
            warn!("Static server did not drain within {:?}, aborting", grace);
            abort.abort();
        }
    }
}
