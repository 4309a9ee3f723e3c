//! Background capture queue
//!
//! Jobs are index records; each one is captured, written to the thumbnails
//! directory and recorded in the index. Failures are tallied per item and
//! never stop the rest of the batch.

use crate::capture::Capturer;
use appdex_common::{thumbnail_file_name, Database, Error, IndexedItem, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How many recent failures `Progress` keeps
const MAX_RECENT_ERRORS: usize = 20;

/// Snapshot of the current batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Names of the items being captured right now
    pub current: Vec<String>,
    pub errors: Vec<CaptureFailure>,
}

impl Progress {
    pub fn is_idle(&self) -> bool {
        self.completed + self.failed >= self.total
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureFailure {
    pub simple_id: String,
    pub name: String,
    pub error: String,
}

struct Context {
    capturer: Capturer,
    db: Database,
    thumbnails_dir: PathBuf,
    progress: watch::Sender<Progress>,
    /// One lock per item id so the same thumbnail is never written twice at once
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Context {
    fn lock_for(&self, id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(id).or_default().clone()
    }

    /// Forget the lock for `id` once nobody but the map holds it
    fn prune_lock(&self, id: i64, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        drop(lock);
        if locks.get(&id).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            locks.remove(&id);
        }
    }

    async fn run(&self, item: IndexedItem) {
        let lock = self.lock_for(item.id);
        let result = {
            let _guard = lock.lock().await;
            self.progress
                .send_modify(|p| p.current.push(item.name.clone()));
            self.capture_one(&item).await
        };
        self.prune_lock(item.id, lock);

        self.progress.send_modify(|p| {
            if let Some(pos) = p.current.iter().position(|n| n == &item.name) {
                p.current.remove(pos);
            }
            match &result {
                Ok(_) => p.completed += 1,
                Err(e) => {
                    p.failed += 1;
                    p.errors.push(CaptureFailure {
                        simple_id: item.simple_id.clone(),
                        name: item.name.clone(),
                        error: e.to_string(),
                    });
                    if p.errors.len() > MAX_RECENT_ERRORS {
                        p.errors.remove(0);
                    }
                }
            }
        });

        match result {
            Ok(path) => debug!("Thumbnail for {} written to {}", item.simple_id, path.display()),
            Err(e) => warn!("Capture of {} ({}) failed: {}", item.simple_id, item.name, e),
        }
    }

    async fn capture_one(&self, item: &IndexedItem) -> Result<PathBuf> {
        let png = self.capturer.capture(&item.to_discovered()).await?;

        tokio::fs::create_dir_all(&self.thumbnails_dir).await?;
        let path = self.thumbnails_dir.join(thumbnail_file_name(&item.simple_id));
        tokio::fs::write(&path, &png).await?;

        let db = self.db.clone();
        let id = item.id;
        let stored = path.to_string_lossy().to_string();
        tokio::task::spawn_blocking(move || db.set_thumbnail(id, &stored))
            .await
            .map_err(|e| Error::Internal(format!("thumbnail update task failed: {}", e)))??;

        Ok(path)
    }
}

/// Pool of capture workers fed through a channel
pub struct CaptureQueue {
    tx: mpsc::UnboundedSender<IndexedItem>,
    progress: watch::Receiver<Progress>,
    context: Arc<Context>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CaptureQueue {
    /// Spawn `workers` tasks; must be called inside a tokio runtime
    pub fn start(
        capturer: Capturer,
        db: Database,
        thumbnails_dir: impl Into<PathBuf>,
        workers: usize,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<IndexedItem>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (progress_tx, progress) = watch::channel(Progress::default());
        let shutdown = CancellationToken::new();

        let context = Arc::new(Context {
            capturer,
            db,
            thumbnails_dir: thumbnails_dir.into(),
            progress: progress_tx,
            locks: Mutex::new(HashMap::new()),
        });

        let handles = (0..workers.max(1))
            .map(|n| {
                let rx = rx.clone();
                let context = context.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let next = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                item = rx.recv() => item,
                                _ = shutdown.cancelled() => None,
                            }
                        };
                        let Some(item) = next else { break };

                        tokio::select! {
                            _ = context.run(item) => {}
                            _ = shutdown.cancelled() => break,
                        }
                    }
                    debug!("Capture worker {} exiting", n);
                })
            })
            .collect();

        info!("Started {} capture workers", workers.max(1));
        Self {
            tx,
            progress,
            context,
            shutdown,
            workers: Mutex::new(handles),
        }
    }

    /// Queue items for capture. Starts a new batch if the queue was idle.
    pub fn enqueue(&self, items: Vec<IndexedItem>) -> Result<usize> {
        let count = items.len();
        if count == 0 {
            return Ok(0);
        }

        self.context.progress.send_modify(|p| {
            if p.is_idle() {
                *p = Progress::default();
            }
            p.total += count;
        });
        for item in items {
            self.tx
                .send(item)
                .map_err(|_| Error::Internal("capture queue is shut down".to_string()))?;
        }
        Ok(count)
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    /// Resolve once every queued item has completed or failed
    pub async fn wait_idle(&self) {
        let mut rx = self.progress.clone();
        let _ = rx.wait_for(|p| p.is_idle()).await;
    }

    /// Stop all workers, abandoning in-flight captures
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}
