//! Disk-backed write-back data cache
//!
//! Caches whole remote files on local disk with LRU eviction. Modified
//! files are tracked in a dirty set and never evicted until uploaded.
//! Each payload has a JSON sidecar so the cache can be reconstructed
//! after a restart.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::error::{CloudMountError, Result};
use crate::remote::RemoteClient;

/// Default age after which unused clean entries are swept
pub const DEFAULT_SWEEP_AGE: Duration = Duration::from_secs(24 * 3600);

/// Per-entry sidecar record, written next to the payload as `<hash>.meta`
#[derive(Debug, Serialize, Deserialize)]
struct SidecarRecord {
    remote_path: String,
    cached_time: u64,
    size: u64,
    dirty: bool,
}

#[derive(Debug)]
struct CacheEntry {
    local: PathBuf,
    size: u64,
    cached_time: u64,
    last_access: Instant,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    dirty: HashSet<String>,
}

/// Aggregate cache statistics
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub dirty_entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

/// Disk-backed LRU cache of remote files
pub struct DataCache {
    root: PathBuf,
    max_size: u64,
    inner: Mutex<Inner>,
}

/// Removes a staging directory when the download path unwinds
struct StagingGuard(PathBuf);

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove staging dir {:?}: {e}", self.0);
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

impl DataCache {
    /// Open the cache at `root`, reconstructing entries from sidecars
    pub fn new(root: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let cache = Self {
            root,
            max_size,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                dirty: HashSet::new(),
            }),
        };
        cache.restore()?;
        Ok(cache)
    }

    fn hash_name(remote_path: &str) -> String {
        use std::fmt::Write as _;
        let digest = Sha256::digest(remote_path.as_bytes());
        let mut name = String::with_capacity(64);
        for byte in digest {
            let _ = write!(name, "{byte:02x}");
        }
        name
    }

    fn payload_path(&self, remote_path: &str) -> PathBuf {
        self.root.join(format!("{}.cache", Self::hash_name(remote_path)))
    }

    fn sidecar_path(&self, remote_path: &str) -> PathBuf {
        self.root.join(format!("{}.meta", Self::hash_name(remote_path)))
    }

    /// Rewrite the sidecar for an entry. Best effort: a failed sidecar
    /// write degrades restart recovery, not live operation.
    fn persist(&self, inner: &Inner, remote_path: &str) {
        let Some(entry) = inner.entries.get(remote_path) else {
            return;
        };
        let record = SidecarRecord {
            remote_path: remote_path.to_string(),
            cached_time: entry.cached_time,
            size: entry.size,
            dirty: inner.dirty.contains(remote_path),
        };

        let path = self.sidecar_path(remote_path);
        let tmp = path.with_extension("meta.tmp");
        let result = serde_json::to_vec(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            .and_then(|bytes| fs::write(&tmp, bytes))
            .and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = result {
            error!("failed to persist sidecar for {remote_path}: {e}");
        }
    }

    /// Scan sidecars and reconcile them with on-disk payloads
    fn restore(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            let name = dir_entry.file_name().to_string_lossy().into_owned();

            // Leftovers from interrupted downloads or sidecar writes
            if path.is_dir() && name.starts_with(".dl-") {
                let _ = fs::remove_dir_all(&path);
                continue;
            }
            if name.ends_with(".tmp") {
                let _ = fs::remove_file(&path);
                continue;
            }
            if !name.ends_with(".meta") {
                continue;
            }

            let record: SidecarRecord = match fs::read(&path)
                .map_err(CloudMountError::Io)
                .and_then(|bytes| {
                    serde_json::from_slice(&bytes)
                        .map_err(|e| CloudMountError::Cache(e.to_string()))
                }) {
                Ok(r) => r,
                Err(e) => {
                    warn!("discarding unreadable sidecar {path:?}: {e}");
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };

            let payload = self.payload_path(&record.remote_path);
            let Ok(meta) = fs::metadata(&payload) else {
                // Sidecar without payload
                let _ = fs::remove_file(&path);
                continue;
            };

            if record.dirty {
                inner.dirty.insert(record.remote_path.clone());
            }
            inner.entries.insert(
                record.remote_path,
                CacheEntry {
                    local: payload,
                    size: meta.len(),
                    cached_time: record.cached_time,
                    last_access: Instant::now(),
                },
            );
        }

        // Payloads without a sidecar
        let known: HashSet<PathBuf> = inner.entries.values().map(|e| e.local.clone()).collect();
        for dir_entry in fs::read_dir(&self.root)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|e| e == "cache") && !known.contains(&path) {
                warn!("discarding orphaned cache file {path:?}");
                let _ = fs::remove_file(&path);
            }
        }

        info!(
            "restored {} cached files ({} dirty)",
            inner.entries.len(),
            inner.dirty.len()
        );
        Ok(())
    }

    /// Return the local payload for a cached file, refreshing its size
    /// from disk and touching its LRU recency
    pub fn get_local(&self, remote_path: &str) -> Option<PathBuf> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(remote_path)?;
        match fs::metadata(&entry.local) {
            Ok(meta) => {
                entry.size = meta.len();
                entry.last_access = Instant::now();
                Some(entry.local.clone())
            }
            Err(_) => {
                // Payload vanished out from under us
                inner.entries.remove(remote_path);
                inner.dirty.remove(remote_path);
                let _ = fs::remove_file(self.sidecar_path(remote_path));
                None
            }
        }
    }

    /// Fetch a remote file into the cache, returning the local payload path.
    ///
    /// The transfer lands in a staging directory first and is renamed into
    /// place only after eviction has made room, so a failed download never
    /// leaves a partial payload behind.
    pub async fn download(&self, remote_path: &str, client: &dyn RemoteClient) -> Result<PathBuf> {
        if let Some(local) = self.get_local(remote_path) {
            return Ok(local);
        }

        debug!("downloading to cache: {remote_path}");
        let staging = self.root.join(format!(".dl-{:08x}", rand::random::<u32>()));
        fs::create_dir_all(&staging)?;
        let _guard = StagingGuard(staging.clone());

        let tmp = staging.join("payload");
        client.download(remote_path, &tmp).await?;
        let size = fs::metadata(&tmp)?.len();

        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(remote_path) {
            // Raced with another download of the same path
            entry.last_access = Instant::now();
            return Ok(entry.local.clone());
        }

        self.evict_for(&mut inner, size);

        let local = self.payload_path(remote_path);
        fs::rename(&tmp, &local)?;
        inner.entries.insert(
            remote_path.to_string(),
            CacheEntry {
                local: local.clone(),
                size,
                cached_time: unix_now(),
                last_access: Instant::now(),
            },
        );
        self.persist(&inner, remote_path);

        info!("downloaded to cache: {remote_path} ({size} bytes)");
        Ok(local)
    }

    /// Create a zero-length cached file for a path that does not exist
    /// remotely yet. The entry starts dirty.
    pub fn create_empty(&self, remote_path: &str) -> Result<PathBuf> {
        let mut inner = self.inner.lock();
        let local = self.payload_path(remote_path);
        fs::File::create(&local)?;

        inner.entries.insert(
            remote_path.to_string(),
            CacheEntry {
                local: local.clone(),
                size: 0,
                cached_time: unix_now(),
                last_access: Instant::now(),
            },
        );
        inner.dirty.insert(remote_path.to_string());
        self.persist(&inner, remote_path);

        debug!("created cached file: {remote_path}");
        Ok(local)
    }

    /// Mark a cached file as modified, refreshing its recorded size
    pub fn mark_dirty(&self, remote_path: &str) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(remote_path) else {
            debug!("mark_dirty for uncached path {remote_path}");
            return;
        };
        if let Ok(meta) = fs::metadata(&entry.local) {
            entry.size = meta.len();
        }
        inner.dirty.insert(remote_path.to_string());
        self.persist(&inner, remote_path);
    }

    /// Mark a cached file as uploaded
    pub fn mark_clean(&self, remote_path: &str) {
        let mut inner = self.inner.lock();
        if inner.dirty.remove(remote_path) && inner.entries.contains_key(remote_path) {
            self.persist(&inner, remote_path);
        }
    }

    pub fn is_dirty(&self, remote_path: &str) -> bool {
        self.inner.lock().dirty.contains(remote_path)
    }

    /// Evict a clean entry. Refuses dirty entries.
    pub fn evict(&self, remote_path: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.dirty.contains(remote_path) {
            warn!("refusing to evict dirty entry: {remote_path}");
            return false;
        }
        self.drop_entry(&mut inner, remote_path)
    }

    /// Remove an entry unconditionally (the remote file is gone)
    pub fn remove(&self, remote_path: &str) {
        let mut inner = self.inner.lock();
        inner.dirty.remove(remote_path);
        self.drop_entry(&mut inner, remote_path);
    }

    fn drop_entry(&self, inner: &mut Inner, remote_path: &str) -> bool {
        let Some(entry) = inner.entries.remove(remote_path) else {
            return false;
        };
        if let Err(e) = fs::remove_file(&entry.local) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!("failed to remove cache file for {remote_path}: {e}");
            }
        }
        let _ = fs::remove_file(self.sidecar_path(remote_path));
        debug!("evicted from cache: {remote_path}");
        true
    }

    /// Evict least-recently-used clean entries until `required_bytes` more
    /// would fit. Dirty entries are never candidates; if only dirty entries
    /// remain the cache is allowed to exceed `max_size`.
    fn evict_for(&self, inner: &mut Inner, required_bytes: u64) {
        let mut total: u64 = inner.entries.values().map(|e| e.size).sum();

        while total + required_bytes > self.max_size {
            let lru = inner
                .entries
                .iter()
                .filter(|(path, _)| !inner.dirty.contains(*path))
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(path, entry)| (path.clone(), entry.size));

            let Some((path, size)) = lru else {
                warn!(
                    "cannot evict: all {} cached files are dirty; cache exceeds its size limit",
                    inner.entries.len()
                );
                break;
            };

            self.drop_entry(inner, &path);
            total -= size;
        }
    }

    /// Snapshot of dirty entries as (local payload, remote path) pairs
    pub fn dirty_snapshot(&self) -> Vec<(PathBuf, String)> {
        let inner = self.inner.lock();
        inner
            .dirty
            .iter()
            .filter_map(|path| {
                let entry = inner.entries.get(path)?;
                entry.local.exists().then(|| (entry.local.clone(), path.clone()))
            })
            .collect()
    }

    /// Cached remote paths whose parent directory equals `dir`
    pub fn list_in_dir(&self, dir: &str) -> Vec<String> {
        let dir = if dir == "/" { "/" } else { dir.trim_end_matches('/') };
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(path, entry)| parent_dir(path) == dir && entry.local.exists())
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Evict clean entries that have not been accessed within `max_age`
    pub fn sweep_expired(&self, max_age: Duration) {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(path, entry)| {
                entry.last_access.elapsed() > max_age && !inner.dirty.contains(*path)
            })
            .map(|(path, _)| path.clone())
            .collect();

        for path in &expired {
            self.drop_entry(&mut inner, path);
        }
        if !expired.is_empty() {
            info!("swept {} expired cache files", expired.len());
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            dirty_entries: inner.dirty.len(),
            total_bytes: inner.entries.values().map(|e| e.size).sum(),
            max_bytes: self.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Remote stub that "downloads" a fixed payload
    struct FixedRemote(Vec<u8>);

    #[async_trait]
    impl RemoteClient for FixedRemote {
        async fn list(&self, _path: &str) -> Result<Vec<crate::remote::RemoteEntry>> {
            Ok(Vec::new())
        }
        async fn upload(&self, _local: &Path, _remote: &str) -> Result<()> {
            Ok(())
        }
        async fn download(&self, _remote: &str, local: &Path) -> Result<()> {
            fs::write(local, &self.0)?;
            Ok(())
        }
        async fn create_dir(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn rename(&self, _from: &str, _to: &str) -> Result<()> {
            Ok(())
        }
    }

    fn write_payload(cache: &DataCache, path: &str, data: &[u8]) {
        let local = cache.get_local(path).unwrap();
        let mut f = fs::OpenOptions::new().write(true).open(local).unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
    }

    #[test]
    fn test_create_empty_is_dirty_and_persisted() {
        let dir = TempDir::new().unwrap();
        let cache = DataCache::new(dir.path(), 1024).unwrap();

        let local = cache.create_empty("/new.txt").unwrap();
        assert!(local.exists());
        assert!(cache.is_dirty("/new.txt"));
        assert!(cache.sidecar_path("/new.txt").exists());
    }

    #[test]
    fn test_mark_dirty_refreshes_size() {
        let dir = TempDir::new().unwrap();
        let cache = DataCache::new(dir.path(), 1024).unwrap();

        cache.create_empty("/f.txt").unwrap();
        write_payload(&cache, "/f.txt", b"hello");
        cache.mark_dirty("/f.txt");

        assert_eq!(cache.stats().total_bytes, 5);
    }

    #[tokio::test]
    async fn test_eviction_skips_dirty_entries() {
        let dir = TempDir::new().unwrap();
        // Room for three 4-byte files
        let cache = DataCache::new(dir.path(), 12).unwrap();

        for path in ["/d", "/c1", "/c2"] {
            cache.create_empty(path).unwrap();
            write_payload(&cache, path, b"aaaa");
            cache.mark_dirty(path);
        }
        cache.mark_clean("/c1");
        cache.mark_clean("/c2");
        // Make /c1 the least recently used clean entry
        cache.get_local("/c2").unwrap();

        cache.download("/c3", &FixedRemote(b"bbbb".to_vec())).await.unwrap();

        assert!(cache.get_local("/d").is_some());
        assert!(cache.get_local("/c1").is_none());
        assert!(cache.get_local("/c2").is_some());
        assert!(cache.get_local("/c3").is_some());
    }

    #[tokio::test]
    async fn test_all_dirty_blocks_eviction() {
        let dir = TempDir::new().unwrap();
        let cache = DataCache::new(dir.path(), 4).unwrap();

        cache.create_empty("/d1").unwrap();
        write_payload(&cache, "/d1", b"aaaa");
        cache.mark_dirty("/d1");

        cache.download("/x", &FixedRemote(b"bbbb".to_vec())).await.unwrap();

        // Nothing evicted: the size limit is exceeded rather than dropping
        // unflushed data
        assert!(cache.is_dirty("/d1"));
        assert!(cache.get_local("/d1").is_some());
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let cache = DataCache::new(dir.path(), 1024).unwrap();
            cache.create_empty("/keep.txt").unwrap();
            write_payload(&cache, "/keep.txt", b"data");
            cache.mark_dirty("/keep.txt");

            cache.create_empty("/clean.txt").unwrap();
            cache.mark_clean("/clean.txt");
        }

        let cache = DataCache::new(dir.path(), 1024).unwrap();
        assert!(cache.is_dirty("/keep.txt"));
        assert!(!cache.is_dirty("/clean.txt"));
        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.dirty_snapshot().len(), 1);
    }

    #[test]
    fn test_restore_drops_orphans() {
        let dir = TempDir::new().unwrap();
        {
            let cache = DataCache::new(dir.path(), 1024).unwrap();
            cache.create_empty("/gone.txt").unwrap();
            // Payload deleted behind the cache's back
            fs::remove_file(cache.payload_path("/gone.txt")).unwrap();
        }
        // A payload with no sidecar
        fs::write(dir.path().join(format!("{}.cache", "0".repeat(64))), b"x").unwrap();

        let cache = DataCache::new(dir.path(), 1024).unwrap();
        assert_eq!(cache.stats().entries, 0);
        assert!(!dir.path().join(format!("{}.cache", "0".repeat(64))).exists());
    }

    #[test]
    fn test_list_in_dir() {
        let dir = TempDir::new().unwrap();
        let cache = DataCache::new(dir.path(), 1024).unwrap();

        cache.create_empty("/docs/a.txt").unwrap();
        cache.create_empty("/docs/b.txt").unwrap();
        cache.create_empty("/other.txt").unwrap();

        let mut in_docs = cache.list_in_dir("/docs");
        in_docs.sort();
        assert_eq!(in_docs, vec!["/docs/a.txt", "/docs/b.txt"]);
        assert_eq!(cache.list_in_dir("/"), vec!["/other.txt"]);
    }

    #[test]
    fn test_sweep_expired_keeps_dirty() {
        let dir = TempDir::new().unwrap();
        let cache = DataCache::new(dir.path(), 1024).unwrap();

        cache.create_empty("/dirty.txt").unwrap();
        cache.create_empty("/clean.txt").unwrap();
        cache.mark_clean("/clean.txt");

        cache.sweep_expired(Duration::ZERO);

        assert!(cache.get_local("/dirty.txt").is_some());
        assert!(cache.get_local("/clean.txt").is_none());
    }

    #[test]
    fn test_remove_discards_dirty_entry() {
        let dir = TempDir::new().unwrap();
        let cache = DataCache::new(dir.path(), 1024).unwrap();

        let local = cache.create_empty("/x.txt").unwrap();
        cache.remove("/x.txt");

        assert!(!local.exists());
        assert!(!cache.is_dirty("/x.txt"));
        assert!(cache.get_local("/x.txt").is_none());
    }

    #[test]
    fn test_evict_refuses_dirty() {
        let dir = TempDir::new().unwrap();
        let cache = DataCache::new(dir.path(), 1024).unwrap();

        cache.create_empty("/x.txt").unwrap();
        assert!(!cache.evict("/x.txt"));
        assert!(cache.get_local("/x.txt").is_some());

        cache.mark_clean("/x.txt");
        assert!(cache.evict("/x.txt"));
        assert!(cache.get_local("/x.txt").is_none());
    }
}
