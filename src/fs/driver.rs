//! Path-based POSIX operation dispatcher
//!
//! Translates filesystem calls into cache lookups, remote RPCs, and queue
//! submissions. Local cache state always takes precedence over remote
//! metadata so writes are visible to the kernel before they upload.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cache::data::DEFAULT_SWEEP_AGE;
use crate::cache::{DataCache, MetadataCache};
use crate::config::Config;
use crate::error::{CloudMountError, Result};
use crate::queue::{OperationQueue, QueueConfig};
use crate::remote::{RemoteClient, RemoteEntry};

/// Ensure a single leading `/` and no trailing `/` (except root)
pub fn normalize_path(path: &str) -> String {
    let mut p = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    while p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    p
}

pub(crate) fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// State for one open file handle
#[derive(Debug)]
struct OpenFile {
    path: String,
    cache_file: PathBuf,
    flags: i32,
    modified: bool,
    synced_via_fsync: bool,
}

#[derive(Default)]
struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

/// The filesystem driver: owns the caches, the operation queue, and the
/// open-file table
pub struct Driver {
    remote: Arc<dyn RemoteClient>,
    metadata: Arc<MetadataCache>,
    data: Arc<DataCache>,
    queue: Arc<OperationQueue>,
    config: Config,
    handles: DashMap<u64, OpenFile>,
    next_fh: AtomicU64,
    shutdown: Shutdown,
}

impl Driver {
    pub fn new(config: Config, remote: Arc<dyn RemoteClient>) -> Result<Arc<Self>> {
        let metadata = Arc::new(MetadataCache::new(config.cache_ttl));
        let data = Arc::new(DataCache::new(
            config.cache_location.clone(),
            config.cache_size,
        )?);
        let queue = Arc::new(OperationQueue::new(
            remote.clone(),
            QueueConfig {
                max_concurrent_uploads: config.max_concurrent_uploads,
                max_concurrent_downloads: config.max_concurrent_downloads,
                max_queue_size: config.max_queue_size,
                ..QueueConfig::default()
            },
        ));

        // An upload that exhausts its retries must not stay marked clean,
        // or the bytes would never reach the remote
        {
            let data = data.clone();
            queue.set_upload_failure_hook(move |path| {
                warn!("upload permanently failed, re-marking dirty: {path}");
                data.mark_dirty(path);
            });
        }

        Ok(Arc::new(Self {
            remote,
            metadata,
            data,
            queue,
            config,
            handles: DashMap::new(),
            next_fh: AtomicU64::new(0),
            shutdown: Shutdown::default(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn data_cache(&self) -> &Arc<DataCache> {
        &self.data
    }

    pub fn metadata_cache(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Resolve attributes for a path.
    ///
    /// A cached payload on disk wins over everything else so that local
    /// writes are visible immediately, even before upload.
    pub async fn getattr(&self, path: &str) -> Result<RemoteEntry> {
        let path = normalize_path(path);
        debug!("getattr: {path}");

        if path == "/" {
            let attrs = RemoteEntry::directory("/", "/", unix_now());
            self.metadata.put_attrs(&path, attrs.clone());
            return Ok(attrs);
        }

        if let Some(local) = self.data.get_local(&path) {
            if let Ok(meta) = fs::metadata(&local) {
                let attrs =
                    RemoteEntry::file(basename(&path), path.as_str(), meta.len(), mtime_secs(&meta));
                self.metadata.put_attrs(&path, attrs.clone());
                return Ok(attrs);
            }
        }

        if let Some(attrs) = self.metadata.get_attrs(&path) {
            return Ok(attrs);
        }

        let name = basename(&path).to_string();
        let items = self.remote.list(parent_dir(&path)).await.map_err(|e| match e {
            CloudMountError::NotFound(_) => CloudMountError::NotFound(path.clone()),
            other => other,
        })?;
        for item in items {
            if item.name == name {
                self.metadata.put_attrs(&path, item.clone());
                return Ok(item);
            }
        }
        Err(CloudMountError::NotFound(path))
    }

    /// List a directory: the union of the remote listing and cached files
    /// that have not been uploaded yet
    pub async fn readdir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let path = normalize_path(path);
        debug!("readdir: {path}");

        let mut entries: Vec<RemoteEntry> = Vec::new();
        match self.remote.list(&path).await {
            Ok(items) => {
                for item in items {
                    self.metadata.put_attrs(&item.path, item.clone());
                    entries.push(item);
                }
            }
            // The directory may exist only locally so far
            Err(CloudMountError::NotFound(_)) => {}
            Err(e) => error!("readdir remote error for {path}: {e}"),
        }

        for cached in self.data.list_in_dir(&path) {
            if entries.iter().any(|e| e.path == cached) {
                continue;
            }
            if let Some(local) = self.data.get_local(&cached) {
                if let Ok(meta) = fs::metadata(&local) {
                    entries.push(RemoteEntry::file(
                        basename(&cached),
                        cached.as_str(),
                        meta.len(),
                        mtime_secs(&meta),
                    ));
                }
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        self.metadata
            .put_listing(&path, entries.iter().map(|e| e.name.clone()).collect());
        Ok(entries)
    }

    pub async fn mkdir(&self, path: &str) -> Result<RemoteEntry> {
        let path = normalize_path(path);
        debug!("mkdir: {path}");

        self.remote.create_dir(&path).await?;
        self.metadata.invalidate_listing(parent_dir(&path));

        let attrs = RemoteEntry::directory(basename(&path), path.as_str(), unix_now());
        self.metadata.put_attrs(&path, attrs.clone());
        info!("created directory: {path}");
        Ok(attrs)
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        debug!("rmdir: {path}");

        self.remote.delete(&path).await?;
        self.metadata.invalidate_listing(parent_dir(&path));
        self.metadata.invalidate(&path);
        self.metadata.invalidate_listing(&path);
        info!("removed directory: {path}");
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        debug!("unlink: {path}");

        self.remote.delete(&path).await?;
        self.metadata.invalidate_listing(parent_dir(&path));
        self.metadata.invalidate(&path);
        self.data.remove(&path);
        info!("deleted file: {path}");
        Ok(())
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = normalize_path(old);
        let new = normalize_path(new);
        debug!("rename: {old} -> {new}");

        self.remote.rename(&old, &new).await?;
        self.metadata.invalidate_listing(parent_dir(&old));
        self.metadata.invalidate_listing(parent_dir(&new));
        self.metadata.invalidate(&old);
        self.metadata.invalidate(&new);
        self.data.remove(&old);
        info!("renamed: {old} -> {new}");
        Ok(())
    }

    /// Open a file, downloading it into the cache if necessary
    pub async fn open(&self, path: &str, flags: i32) -> Result<u64> {
        let path = normalize_path(path);
        debug!("open: {path} flags={flags:#x}");

        let cache_file = match self.data.get_local(&path) {
            Some(local) => local,
            None => match self.data.download(&path, self.remote.as_ref()).await {
                Ok(local) => local,
                Err(CloudMountError::NotFound(_)) if flags & libc::O_CREAT != 0 => {
                    self.data.create_empty(&path)?
                }
                Err(e) => {
                    error!("failed to bring {path} into cache: {e}");
                    return Err(e);
                }
            },
        };

        let mut modified = false;
        if flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY {
            fs::OpenOptions::new()
                .write(true)
                .open(&cache_file)?
                .set_len(0)?;
            self.data.mark_dirty(&path);
            modified = true;
        }

        let fh = self.alloc_fh();
        self.handles.insert(
            fh,
            OpenFile {
                path,
                cache_file,
                flags,
                modified,
                synced_via_fsync: false,
            },
        );
        Ok(fh)
    }

    /// Create a new file as an empty, dirty cache entry
    pub fn create(&self, path: &str) -> Result<u64> {
        let path = normalize_path(path);
        debug!("create: {path}");

        let cache_file = self.data.create_empty(&path)?;
        let fh = self.alloc_fh();
        self.handles.insert(
            fh,
            OpenFile {
                path,
                cache_file,
                flags: libc::O_WRONLY | libc::O_CREAT,
                modified: true,
                synced_via_fsync: false,
            },
        );
        Ok(fh)
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let handle = self.handles.get(&fh).ok_or(CloudMountError::BadHandle(fh))?;

        let mut file = fs::File::open(&handle.cache_file)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(size as usize);
        file.take(size as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let (path, cache_file, flags) = {
            let handle = self.handles.get(&fh).ok_or(CloudMountError::BadHandle(fh))?;
            (handle.path.clone(), handle.cache_file.clone(), handle.flags)
        };

        if !cache_file.exists() {
            fs::File::create(&cache_file)?;
        }

        let mut file = if flags & libc::O_APPEND != 0 {
            fs::OpenOptions::new().append(true).open(&cache_file)?
        } else {
            let mut f = fs::OpenOptions::new().write(true).open(&cache_file)?;
            f.seek(SeekFrom::Start(offset))?;
            f
        };
        file.write_all(data)?;
        file.flush()?;
        file.sync_all()?;

        if let Some(mut handle) = self.handles.get_mut(&fh) {
            handle.modified = true;
            handle.synced_via_fsync = false;
        }
        self.data.mark_dirty(&path);

        debug!("wrote {} bytes to {path} at offset {offset}", data.len());
        Ok(data.len() as u32)
    }

    /// Upload a modified file synchronously.
    ///
    /// The entry is marked clean *before* the upload starts so the
    /// background worker cannot queue a second upload of the same bytes;
    /// on failure the dirty mark is restored. Failures are absorbed:
    /// surfacing them here would break userspace copy tools, and the
    /// background sync retries the file on its next cycle.
    pub async fn flush(&self, fh: u64) {
        let (path, cache_file, flags, modified) = match self.handles.get(&fh) {
            Some(h) => (h.path.clone(), h.cache_file.clone(), h.flags, h.modified),
            None => return,
        };

        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            debug!("flush: skipping read-only handle for {path}");
            return;
        }
        if !modified {
            debug!("flush: {path} not modified, nothing to upload");
            return;
        }

        self.data.mark_clean(&path);

        let size = match fs::metadata(&cache_file) {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!("flush: cannot stat cache file for {path}: {e}");
                self.data.mark_dirty(&path);
                return;
            }
        };

        let upload_timeout = self.config.calculate_upload_timeout(size);
        let wait_timeout = upload_timeout + Duration::from_secs(5);
        info!("flush: synchronous upload of {path} ({size} bytes)");

        let uploaded = match tokio::time::timeout(
            wait_timeout,
            self.queue.upload_file_sync(&cache_file, &path, upload_timeout),
        )
        .await
        {
            Ok(ok) => ok,
            Err(_) => {
                error!("flush: wait for synchronous upload of {path} timed out");
                false
            }
        };

        if uploaded {
            if let Some(mut handle) = self.handles.get_mut(&fh) {
                handle.modified = false;
            }
            self.data.mark_clean(&path);

            // Refresh metadata so the next getattr doesn't fall through to
            // the remote and observe pre-upload state
            if let Ok(meta) = fs::metadata(&cache_file) {
                self.metadata.put_attrs(
                    &path,
                    RemoteEntry::file(basename(&path), path.as_str(), meta.len(), mtime_secs(&meta)),
                );
            }
            info!("flush: upload completed for {path}");
        } else {
            error!("flush: upload failed for {path}, leaving dirty for background sync");
            self.data.mark_dirty(&path);
        }
    }

    pub async fn fsync(&self, fh: u64) {
        self.flush(fh).await;
        if let Some(mut handle) = self.handles.get_mut(&fh) {
            handle.synced_via_fsync = true;
        }
    }

    /// Free the handle. Never uploads: durability is the job of fsync and
    /// the background sync loop.
    pub fn release(&self, fh: u64) {
        if let Some((_, handle)) = self.handles.remove(&fh) {
            debug!(
                "release: {} (modified: {}, synced_via_fsync: {})",
                handle.path, handle.modified, handle.synced_via_fsync
            );
        }
    }

    pub fn truncate(&self, path: &str, length: u64, fh: Option<u64>) -> Result<()> {
        let path = normalize_path(path);
        debug!("truncate: {path} to {length}");

        let cache_file = match fh.and_then(|fh| self.handles.get(&fh).map(|h| h.cache_file.clone()))
        {
            Some(file) => file,
            None => self
                .data
                .get_local(&path)
                .ok_or_else(|| CloudMountError::NotFound(path.clone()))?,
        };

        fs::OpenOptions::new()
            .write(true)
            .open(&cache_file)?
            .set_len(length)?;

        if let Some(fh) = fh {
            if let Some(mut handle) = self.handles.get_mut(&fh) {
                handle.modified = true;
                handle.synced_via_fsync = false;
            }
        }
        self.data.mark_dirty(&path);
        Ok(())
    }

    /// One background maintenance pass: promote queued transfers, enqueue
    /// dirty files, and expire stale cache entries
    pub async fn sync_cycle(&self) {
        self.queue.process_pending().await;

        for (local, remote) in self.data.dirty_snapshot() {
            if self.queue.queue_upload(&local, &remote, 0).await {
                self.data.mark_clean(&remote);
                debug!("queued background upload: {remote}");
            } else {
                warn!("upload queue full, {remote} stays dirty");
            }
        }

        self.data.sweep_expired(DEFAULT_SWEEP_AGE);
        self.metadata.sweep_expired();
    }

    /// Background worker loop; exits when `shutdown` is signalled
    pub async fn run_background(self: Arc<Self>) {
        info!(
            "background sync worker started (interval {:?})",
            self.config.auto_sync_interval
        );
        while !self.shutdown.flag.load(Ordering::SeqCst) {
            self.sync_cycle().await;

            tokio::select! {
                _ = self.shutdown.notify.notified() => break,
                _ = tokio::time::sleep(self.config.auto_sync_interval) => {}
            }
        }
        info!("background sync worker stopped");
    }

    /// Signal the background worker to exit
    pub fn shutdown(&self) {
        self.shutdown.flag.store(true, Ordering::SeqCst);
        self.shutdown.notify.notify_waiters();
    }
}
