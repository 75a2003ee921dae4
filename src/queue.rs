//! Asynchronous upload/download queue
//!
//! Bounded, priority-ordered, deduplicated transfer queues with
//! per-direction concurrency limits, exponential-backoff retry, a
//! synchronous waitable upload path for fsync, and an atomic remote
//! file-replacement protocol for uploads that hit an existing target.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CloudMountError, Result};
use crate::remote::RemoteClient;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queue tuning knobs
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub backoff_factor: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 5,
            max_concurrent_downloads: 10,
            max_queue_size: 1000,
            max_retries: 3,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Upload,
    Download,
}

impl OpKind {
    fn task_key(self, remote_path: &str) -> String {
        match self {
            OpKind::Upload => format!("upload_{remote_path}"),
            OpKind::Download => format!("download_{remote_path}"),
        }
    }
}

/// A queued transfer. Identity for deduplication is the remote path.
#[derive(Debug, Clone)]
struct QueuedOperation {
    kind: OpKind,
    local: PathBuf,
    remote: String,
    priority: i32,
    retry_count: u32,
    #[allow(dead_code)]
    enqueued_at: Instant,
}

/// Monotonic operation counters
#[derive(Debug, Default)]
struct Stats {
    total_uploads: AtomicU64,
    total_downloads: AtomicU64,
    successful_uploads: AtomicU64,
    successful_downloads: AtomicU64,
    failed_uploads: AtomicU64,
    failed_downloads: AtomicU64,
    queue_full_rejections: AtomicU64,
    atomic_replacements: AtomicU64,
    atomic_replacement_failures: AtomicU64,
    atomic_replacement_recoveries: AtomicU64,
}

/// Point-in-time copy of the queue counters
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub total_uploads: u64,
    pub total_downloads: u64,
    pub successful_uploads: u64,
    pub successful_downloads: u64,
    pub failed_uploads: u64,
    pub failed_downloads: u64,
    pub queue_full_rejections: u64,
    pub atomic_replacements: u64,
    pub atomic_replacement_failures: u64,
    pub atomic_replacement_recoveries: u64,
}

/// Point-in-time view of queue occupancy
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub upload_queue_size: usize,
    pub download_queue_size: usize,
    pub pending_uploads: usize,
    pub pending_downloads: usize,
    pub in_flight: usize,
    pub stats: StatsSnapshot,
}

struct State {
    uploads: Vec<QueuedOperation>,
    downloads: Vec<QueuedOperation>,
    pending_uploads: HashSet<String>,
    pending_downloads: HashSet<String>,
    active: HashMap<String, JoinHandle<()>>,
}

impl State {
    fn queue_mut(&mut self, kind: OpKind) -> (&mut Vec<QueuedOperation>, &mut HashSet<String>) {
        match kind {
            OpKind::Upload => (&mut self.uploads, &mut self.pending_uploads),
            OpKind::Download => (&mut self.downloads, &mut self.pending_downloads),
        }
    }

    fn active_count(&self, kind: OpKind) -> usize {
        let prefix = match kind {
            OpKind::Upload => "upload_",
            OpKind::Download => "download_",
        };
        self.active.keys().filter(|k| k.starts_with(prefix)).count()
    }
}

type UploadFailureHook = Box<dyn Fn(&str) + Send + Sync>;

/// Manages asynchronous transfers against the remote store
pub struct OperationQueue {
    remote: Arc<dyn RemoteClient>,
    config: QueueConfig,
    upload_sem: Arc<Semaphore>,
    download_sem: Arc<Semaphore>,
    // Serializes enqueue/scheduling; never held across remote calls
    state: Mutex<State>,
    stats: Stats,
    upload_failure_hook: parking_lot::Mutex<Option<UploadFailureHook>>,
}

impl OperationQueue {
    pub fn new(remote: Arc<dyn RemoteClient>, config: QueueConfig) -> Self {
        Self {
            remote,
            upload_sem: Arc::new(Semaphore::new(config.max_concurrent_uploads)),
            download_sem: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            config,
            state: Mutex::new(State {
                uploads: Vec::new(),
                downloads: Vec::new(),
                pending_uploads: HashSet::new(),
                pending_downloads: HashSet::new(),
                active: HashMap::new(),
            }),
            stats: Stats::default(),
            upload_failure_hook: parking_lot::Mutex::new(None),
        }
    }

    /// Install a callback invoked with the remote path when an upload
    /// exhausts all retries
    pub fn set_upload_failure_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.upload_failure_hook.lock() = Some(Box::new(hook));
    }

    /// Queue an upload. Returns false if the upload queue is full.
    pub async fn queue_upload(&self, local: &Path, remote_path: &str, priority: i32) -> bool {
        self.enqueue(OpKind::Upload, local, remote_path, priority, 0).await
    }

    /// Queue a download. Returns false if the download queue is full.
    pub async fn queue_download(&self, remote_path: &str, local: &Path, priority: i32) -> bool {
        self.enqueue(OpKind::Download, local, remote_path, priority, 0).await
    }

    async fn enqueue(
        &self,
        kind: OpKind,
        local: &Path,
        remote_path: &str,
        priority: i32,
        retry_count: u32,
    ) -> bool {
        let mut state = self.state.lock().await;
        let (queue, pending) = state.queue_mut(kind);

        if queue.len() >= self.config.max_queue_size {
            self.stats.queue_full_rejections.fetch_add(1, Ordering::Relaxed);
            warn!("{kind:?} queue full, rejecting: {remote_path}");
            return false;
        }

        // Deduplicate: a newer operation for the same remote path replaces
        // the queued one
        if pending.contains(remote_path) {
            queue.retain(|op| op.remote != remote_path);
        }

        queue.push(QueuedOperation {
            kind,
            local: local.to_path_buf(),
            remote: remote_path.to_string(),
            priority,
            retry_count,
            enqueued_at: Instant::now(),
        });
        queue.sort_by_key(|op| std::cmp::Reverse(op.priority));
        pending.insert(remote_path.to_string());

        debug!("queued {kind:?}: {remote_path} (priority {priority})");
        true
    }

    /// Promote queued operations into running tasks, respecting the
    /// per-direction concurrency caps. Serialized by the state mutex, so
    /// concurrent callers cannot start the same operation twice.
    pub async fn process_pending(self: &Arc<Self>) {
        let mut state = self.state.lock().await;

        // Reap completed tasks
        let finished: Vec<String> = state
            .active
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();
        for key in finished {
            if let Some(handle) = state.active.remove(&key) {
                if let Err(e) = handle.await {
                    error!("task {key} terminated abnormally: {e}");
                }
            }
        }

        for kind in [OpKind::Upload, OpKind::Download] {
            let cap = match kind {
                OpKind::Upload => self.config.max_concurrent_uploads,
                OpKind::Download => self.config.max_concurrent_downloads,
            };
            let per_cycle = cap.min(state.queue_mut(kind).0.len());

            for _ in 0..per_cycle {
                if state.active_count(kind) >= cap {
                    debug!("{kind:?} concurrency cap reached");
                    break;
                }
                let (queue, pending) = state.queue_mut(kind);
                if queue.is_empty() {
                    break;
                }
                let op = queue.remove(0);
                pending.remove(&op.remote);

                let key = kind.task_key(&op.remote);
                info!("starting {kind:?} task: {}", op.remote);
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.execute(op).await });
                state.active.insert(key, handle);
            }
        }
    }

    async fn execute(self: Arc<Self>, mut op: QueuedOperation) {
        let (sem, totals, successes, failures) = match op.kind {
            OpKind::Upload => (
                &self.upload_sem,
                &self.stats.total_uploads,
                &self.stats.successful_uploads,
                &self.stats.failed_uploads,
            ),
            OpKind::Download => (
                &self.download_sem,
                &self.stats.total_downloads,
                &self.stats.successful_downloads,
                &self.stats.failed_downloads,
            ),
        };

        let Ok(permit) = sem.acquire().await else {
            return;
        };

        totals.fetch_add(1, Ordering::Relaxed);
        let result = match op.kind {
            OpKind::Upload => self.upload_with_retry(&op.local, &op.remote).await,
            OpKind::Download => self.download_with_retry(&op.remote, &op.local).await,
        };

        match result {
            Ok(()) => {
                successes.fetch_add(1, Ordering::Relaxed);
                info!("{:?} completed: {}", op.kind, op.remote);
            }
            Err(e) => {
                failures.fetch_add(1, Ordering::Relaxed);
                error!("{:?} failed: {}: {e}", op.kind, op.remote);

                // The permit must be released before re-enqueueing so the
                // slot is free for other work
                drop(permit);

                if op.retry_count < self.config.max_retries {
                    op.retry_count += 1;
                    info!("re-queueing {:?} (retry {}): {}", op.kind, op.retry_count, op.remote);
                    let requeued = self
                        .enqueue(op.kind, &op.local, &op.remote, op.priority, op.retry_count)
                        .await;
                    if !requeued {
                        error!("failed to re-queue {:?}: {}", op.kind, op.remote);
                        self.report_terminal_failure(&op);
                    }
                } else {
                    self.report_terminal_failure(&op);
                }
            }
        }
    }

    fn report_terminal_failure(&self, op: &QueuedOperation) {
        if op.kind == OpKind::Upload {
            if let Some(hook) = &*self.upload_failure_hook.lock() {
                hook(&op.remote);
            }
        }
    }

    /// Run an operation with exponential backoff: wait factor^attempt
    /// seconds between attempts, surfacing the last error.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last = None;
        for attempt in 0..self.config.max_retries {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(
                        "operation failed (attempt {}/{}): {e}",
                        attempt + 1,
                        self.config.max_retries
                    );
                    last = Some(e);
                    if attempt + 1 < self.config.max_retries {
                        let wait = self.config.backoff_factor.powi(attempt as i32);
                        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| CloudMountError::Backend("operation failed".to_string())))
    }

    async fn upload_with_retry(&self, local: &Path, remote_path: &str) -> Result<()> {
        self.with_retry(|| self.attempt_upload(local, remote_path)).await
    }

    async fn attempt_upload(&self, local: &Path, remote_path: &str) -> Result<()> {
        if !local.exists() {
            return Err(CloudMountError::NotFound(format!(
                "local file missing: {}",
                local.display()
            )));
        }

        match self.remote.upload(local, remote_path).await {
            Ok(()) => Ok(()),
            Err(CloudMountError::Conflict(_)) => {
                info!("target exists, replacing atomically: {remote_path}");
                self.atomic_replace(local, remote_path).await
            }
            Err(e) => Err(e),
        }
    }

    /// Replace an existing remote file without a window where readers see
    /// partial content: upload to a temporary name, delete the original,
    /// rename the temporary into place.
    async fn atomic_replace(&self, local: &Path, target: &str) -> Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let temp = format!("{target}.tmp.{timestamp}.{:08x}", rand::random::<u32>());
        debug!("atomic replacement via {temp}");

        self.remote.upload(local, &temp).await?;

        if let Err(delete_err) = self.remote.delete(target).await {
            warn!("failed to delete original {target}: {delete_err}");
            if let Err(cleanup_err) = self.remote.delete(&temp).await {
                error!("failed to clean up temporary {temp}: {cleanup_err}");
            }
            return Err(delete_err);
        }

        match self.remote.rename(&temp, target).await {
            Ok(()) => {
                self.stats.atomic_replacements.fetch_add(1, Ordering::Relaxed);
                info!("atomic replacement completed: {target}");
                Ok(())
            }
            Err(first_err) => {
                // The original is gone and the temporary holds the only
                // remote copy; retry the rename once before giving up
                warn!("rename {temp} -> {target} failed ({first_err}), retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                match self.remote.rename(&temp, target).await {
                    Ok(()) => {
                        self.stats.atomic_replacements.fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .atomic_replacement_recoveries
                            .fetch_add(1, Ordering::Relaxed);
                        info!("atomic replacement recovered: {target}");
                        Ok(())
                    }
                    Err(second_err) => {
                        self.stats
                            .atomic_replacement_failures
                            .fetch_add(1, Ordering::Relaxed);
                        error!(
                            "CRITICAL: atomic replacement stranded; original deleted, \
                             data preserved at {temp}: {second_err}"
                        );
                        Err(CloudMountError::ReplacementStranded {
                            temp,
                            target: target.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Operator entry point: rename a stranded replacement temporary to
    /// its intended target
    pub async fn recover_failed_atomic_replacement(&self, temp: &str, target: &str) -> Result<()> {
        info!("manual recovery: {temp} -> {target}");
        self.remote.rename(temp, target).await
    }

    async fn download_with_retry(&self, remote_path: &str, local: &Path) -> Result<()> {
        self.with_retry(|| self.attempt_download(remote_path, local)).await
    }

    async fn attempt_download(&self, remote_path: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.remote.download(remote_path, local).await
    }

    /// Upload a file and wait for it to finish, bypassing the queue so
    /// pending background work cannot starve it. The upload still counts
    /// against the concurrency cap. Returns false on failure or timeout.
    pub async fn upload_file_sync(&self, local: &Path, remote_path: &str, timeout: Duration) -> bool {
        if !local.exists() {
            error!("synchronous upload of missing file: {}", local.display());
            return false;
        }
        info!(
            "synchronous upload: {} -> {remote_path} (timeout {timeout:?})",
            local.display()
        );

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, async {
            let Ok(_permit) = self.upload_sem.acquire().await else {
                return Err(CloudMountError::Backend("upload slots closed".to_string()));
            };
            self.upload_with_retry(local, remote_path).await
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                info!(
                    "synchronous upload completed: {remote_path} ({:.2}s)",
                    started.elapsed().as_secs_f64()
                );
                true
            }
            Ok(Err(e)) => {
                error!("synchronous upload failed: {remote_path}: {e}");
                false
            }
            Err(_) => {
                error!("synchronous upload timed out after {timeout:?}: {remote_path}");
                false
            }
        }
    }

    /// Block until both queues and all in-flight tasks drain
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            {
                let state = self.state.lock().await;
                let drained = state.uploads.is_empty()
                    && state.downloads.is_empty()
                    && state.active.values().all(|h| h.is_finished());
                if drained {
                    return;
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("timeout waiting for queued operations to complete");
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait for the upload of one specific remote path to finish.
    /// Returns false on timeout or abnormal task termination.
    pub async fn wait_for_file_upload(&self, remote_path: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let key = OpKind::Upload.task_key(remote_path);

        loop {
            {
                let mut state = self.state.lock().await;
                if !state.pending_uploads.contains(remote_path) {
                    match state.active.get(&key).map(|h| h.is_finished()) {
                        Some(false) => {}
                        Some(true) => {
                            if let Some(handle) = state.active.remove(&key) {
                                return handle.await.is_ok();
                            }
                            return true;
                        }
                        // Neither queued nor running: already completed
                        None => return true,
                    }
                }
            }
            if Instant::now() >= deadline {
                warn!("timeout waiting for upload: {remote_path}");
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Drop all queued operations and abort in-flight tasks
    pub async fn cancel_all(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock().await;
            state.uploads.clear();
            state.downloads.clear();
            state.pending_uploads.clear();
            state.pending_downloads.clear();
            for handle in state.active.values() {
                handle.abort();
            }
            state.active.drain().map(|(_, h)| h).collect()
        };
        join_all(handles).await;
        info!("all queued operations cancelled");
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        QueueStatus {
            upload_queue_size: state.uploads.len(),
            download_queue_size: state.downloads.len(),
            pending_uploads: state.pending_uploads.len(),
            pending_downloads: state.pending_downloads.len(),
            in_flight: state.active.len(),
            stats: self.stats_snapshot(),
        }
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_uploads: self.stats.total_uploads.load(Ordering::Relaxed),
            total_downloads: self.stats.total_downloads.load(Ordering::Relaxed),
            successful_uploads: self.stats.successful_uploads.load(Ordering::Relaxed),
            successful_downloads: self.stats.successful_downloads.load(Ordering::Relaxed),
            failed_uploads: self.stats.failed_uploads.load(Ordering::Relaxed),
            failed_downloads: self.stats.failed_downloads.load(Ordering::Relaxed),
            queue_full_rejections: self.stats.queue_full_rejections.load(Ordering::Relaxed),
            atomic_replacements: self.stats.atomic_replacements.load(Ordering::Relaxed),
            atomic_replacement_failures: self
                .stats
                .atomic_replacement_failures
                .load(Ordering::Relaxed),
            atomic_replacement_recoveries: self
                .stats
                .atomic_replacement_recoveries
                .load(Ordering::Relaxed),
        }
    }
}
