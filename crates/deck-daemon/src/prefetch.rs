//! Prefetch/cache coordinator.
//!
//! Makes sure a file is on local disk before mpv is asked to play it.  The
//! byte transfer itself is the remote store's business; we only track it
//! through a pollable `DownloadTask`.

use crate::error::EngineError;
use crate::remote::{Catalog, RemoteStore};
use crate::selector;
use chrono::Utc;
use deck_proto::protocol::{Direction, DownloadStatus, DownloadTask, SourceKind};
use deck_proto::state::StateStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of `ensure_local`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub source: SourceKind,
    /// Set when a transfer was needed.
    pub task_id: Option<String>,
}

type TaskMap = Arc<RwLock<HashMap<String, DownloadTask>>>;

/// `None` while the transfer runs, then its result.
type Outcome = Option<Result<PathBuf, String>>;

/// The one transfer allowed per filename at a time.
struct Transfer {
    task_id: String,
    done: watch::Receiver<Outcome>,
}

type TransferMap = Arc<Mutex<HashMap<String, Transfer>>>;

enum Claim {
    Cached(PathBuf),
    Joined(Transfer),
    Started(Transfer),
}

pub struct Prefetcher {
    cache_dir: PathBuf,
    remote: Arc<dyn RemoteStore>,
    tasks: TaskMap,
    transfers: TransferMap,
    poll_interval: Duration,
}

impl Prefetcher {
    pub fn new(cache_dir: PathBuf, remote: Arc<dyn RemoteStore>, poll_interval: Duration) -> Self {
        Self {
            cache_dir,
            remote,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            transfers: Arc::new(Mutex::new(HashMap::new())),
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }

    /// Where `filename` lives in the cache.  Catalog names are flat; anything
    /// that could escape the cache directory is rejected.
    pub fn local_path(&self, filename: &str) -> Result<PathBuf, EngineError> {
        let bad = filename.trim().is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename == "."
            || filename == "..";
        if bad {
            return Err(EngineError::InvalidRequest(format!(
                "not a catalog filename: {:?}",
                filename
            )));
        }
        Ok(self.cache_dir.join(filename))
    }

    pub fn is_cached(&self, filename: &str) -> bool {
        self.local_path(filename)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Return a local path for `filename`, fetching it first if needed.
    /// Blocks for the whole transfer.  A transfer already running for the
    /// same file is awaited rather than started twice.
    pub async fn ensure_local(&self, filename: &str) -> Result<LocalFile, EngineError> {
        let transfer = match self.claim(filename).await? {
            Claim::Cached(path) => {
                debug!("prefetch: cache hit {}", filename);
                return Ok(LocalFile {
                    path,
                    source: SourceKind::Cache,
                    task_id: None,
                });
            }
            Claim::Joined(transfer) => {
                debug!("prefetch: joining task {} for {}", transfer.task_id, filename);
                transfer
            }
            Claim::Started(transfer) => transfer,
        };

        let path = wait_for_outcome(transfer.done)
            .await
            .map_err(EngineError::FetchFailed)?;
        Ok(LocalFile {
            path,
            source: SourceKind::Remote,
            task_id: Some(transfer.task_id),
        })
    }

    /// Start a background fetch unless the file is cached or already on its
    /// way.  Returns the new task id.
    pub async fn prefetch_in_background(&self, filename: &str) -> Option<String> {
        match self.claim(filename).await {
            Ok(Claim::Started(transfer)) => Some(transfer.task_id),
            Ok(_) => None,
            Err(e) => {
                warn!("prefetch: could not start {}: {}", filename, e);
                None
            }
        }
    }

    #[cfg(test)]
    pub async fn in_flight(&self, filename: &str) -> bool {
        self.transfers.lock().await.contains_key(filename)
    }

    pub async fn task(&self, id: &str) -> Option<DownloadTask> {
        self.tasks.read().await.get(id).cloned()
    }

    /// All retained tasks, oldest first.
    pub async fn tasks(&self) -> Vec<DownloadTask> {
        let mut list: Vec<DownloadTask> = self.tasks.read().await.values().cloned().collect();
        list.sort_by_key(|t| t.start_time);
        list
    }

    /// Decide under the transfer lock whether `filename` is cached, already
    /// being fetched, or needs a new transfer.  A file with a transfer in
    /// flight is never reported as cached, since it may be half written.
    async fn claim(&self, filename: &str) -> Result<Claim, EngineError> {
        let dest = self.local_path(filename)?;
        let mut transfers = self.transfers.lock().await;
        if let Some(running) = transfers.get(filename) {
            return Ok(Claim::Joined(Transfer {
                task_id: running.task_id.clone(),
                done: running.done.clone(),
            }));
        }
        if dest.is_file() {
            return Ok(Claim::Cached(dest));
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| EngineError::FetchFailed(format!("cannot create cache dir: {}", e)))?;

        let id = uuid::Uuid::new_v4().to_string();
        let task = DownloadTask {
            id: id.clone(),
            filename: filename.to_string(),
            total_size: 0,
            current_size: 0,
            status: DownloadStatus::Downloading,
            error: None,
            start_time: Utc::now(),
        };
        self.tasks.write().await.insert(id.clone(), task);

        let (tx, rx) = watch::channel(None);
        transfers.insert(
            filename.to_string(),
            Transfer {
                task_id: id.clone(),
                done: rx.clone(),
            },
        );
        drop(transfers);
        info!("prefetch: task {} fetching {}", id, filename);

        let job = TransferJob {
            remote: self.remote.clone(),
            tasks: self.tasks.clone(),
            transfers: self.transfers.clone(),
            id: id.clone(),
            filename: filename.to_string(),
            dest,
            poll_interval: self.poll_interval,
        };
        tokio::spawn(job.run(tx));
        Ok(Claim::Started(Transfer { task_id: id, done: rx }))
    }
}

async fn wait_for_outcome(mut done: watch::Receiver<Outcome>) -> Result<PathBuf, String> {
    let result = match done.wait_for(Option::is_some).await {
        Ok(outcome) => match &*outcome {
            Some(result) => result.clone(),
            None => Err("transfer finished without a result".to_string()),
        },
        Err(_) => Err("transfer task ended without a result".to_string()),
    };
    result
}

struct TransferJob {
    remote: Arc<dyn RemoteStore>,
    tasks: TaskMap,
    transfers: TransferMap,
    id: String,
    filename: String,
    dest: PathBuf,
    poll_interval: Duration,
}

impl TransferJob {
    /// Drive one fetch to completion, sampling the destination size meanwhile,
    /// then publish the result to everyone waiting on it.
    async fn run(self, done: watch::Sender<Outcome>) {
        match self.remote.size(&self.filename).await {
            Ok(total) => self.update(|task| task.total_size = total).await,
            Err(e) => debug!("prefetch: size of {} unknown: {}", self.filename, e),
        }

        let mut fetch = {
            let remote = self.remote.clone();
            let filename = self.filename.clone();
            let dest = self.dest.clone();
            tokio::spawn(async move { remote.fetch(&filename, &dest).await })
        };

        let mut ticker = tokio::time::interval(self.poll_interval);
        let outcome = loop {
            tokio::select! {
                res = &mut fetch => break res,
                _ = ticker.tick() => {
                    if let Ok(meta) = tokio::fs::metadata(&self.dest).await {
                        self.update(|task| task.current_size = meta.len()).await;
                    }
                }
            }
        };

        let result = match outcome {
            Ok(Ok(())) => match tokio::fs::metadata(&self.dest).await {
                Ok(meta) if meta.is_file() => Ok(meta.len()),
                _ => Err("remote fetch reported success but the file is missing".to_string()),
            },
            Ok(Err(reason)) => Err(reason),
            Err(e) => Err(format!("fetch task aborted: {}", e)),
        };

        let result = match result {
            Ok(len) => {
                info!("prefetch: task {} completed {} ({} bytes)", self.id, self.filename, len);
                self.update(|task| {
                    task.current_size = len;
                    if task.total_size == 0 {
                        task.total_size = len;
                    }
                    task.status = DownloadStatus::Completed;
                })
                .await;
                Ok(self.dest.clone())
            }
            Err(reason) => {
                warn!("prefetch: task {} failed for {}: {}", self.id, self.filename, reason);
                // Never leave a half-written file that would later read as a cache hit.
                let _ = tokio::fs::remove_file(&self.dest).await;
                self.update(|task| {
                    task.status = DownloadStatus::Error;
                    task.error = Some(reason.clone());
                })
                .await;
                Err(reason)
            }
        };

        let mut transfers = self.transfers.lock().await;
        done.send_replace(Some(result));
        transfers.remove(&self.filename);
    }

    async fn update(&self, f: impl FnOnce(&mut DownloadTask)) {
        if let Some(task) = self.tasks.write().await.get_mut(&self.id) {
            f(task);
        }
    }
}

// ── auto-cache-next worker ────────────────────────────────────────────────────

/// Periodically prefetch the track that would follow the current one, while
/// `enabled` is set.
pub async fn run_auto_cache(
    state: Arc<StateStore>,
    catalog: Arc<Catalog>,
    prefetcher: Arc<Prefetcher>,
    enabled: Arc<AtomicBool>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !enabled.load(Ordering::Relaxed) {
            continue;
        }
        let current = state.get().await.current_file;
        if current.is_empty() {
            continue;
        }
        let files = catalog.snapshot().await;
        let Some(idx) = selector::index_of(&current, &files) else {
            continue;
        };
        let next = match selector::select(&files[idx], &files, Direction::Next, &mut rand::thread_rng()) {
            Ok(next) => next,
            Err(_) => continue,
        };
        if let Some(task_id) = prefetcher.prefetch_in_background(&next).await {
            info!("auto-cache: prefetching {} as task {}", next, task_id);
        }
    }
    debug!("auto-cache: worker stopped");
}
