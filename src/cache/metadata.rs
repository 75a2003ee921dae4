//! TTL-bounded metadata cache
//!
//! Caches file attributes and directory listings, both keyed by remote
//! path. Entries older than the TTL are treated as absent and removed
//! in-line on read. Negative results are never cached.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::remote::RemoteEntry;

struct Inner {
    file_attrs: HashMap<String, (RemoteEntry, Instant)>,
    dir_listings: HashMap<String, (Vec<String>, Instant)>,
}

/// Thread-safe cache for file attributes and directory listings
pub struct MetadataCache {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner {
                file_attrs: HashMap::new(),
                dir_listings: HashMap::new(),
            }),
        }
    }

    /// Get cached attributes, removing the entry if it has expired
    pub fn get_attrs(&self, path: &str) -> Option<RemoteEntry> {
        let mut inner = self.inner.lock();
        match inner.file_attrs.get(path) {
            Some((_, inserted)) if inserted.elapsed() > self.ttl => {
                inner.file_attrs.remove(path);
                None
            }
            Some((attrs, _)) => {
                trace!("attrs cache hit: {path}");
                Some(attrs.clone())
            }
            None => None,
        }
    }

    pub fn put_attrs(&self, path: &str, attrs: RemoteEntry) {
        let mut inner = self.inner.lock();
        inner
            .file_attrs
            .insert(path.to_string(), (attrs, Instant::now()));
    }

    /// Get a cached directory listing, removing the entry if it has expired
    pub fn get_listing(&self, path: &str) -> Option<Vec<String>> {
        let mut inner = self.inner.lock();
        match inner.dir_listings.get(path) {
            Some((_, inserted)) if inserted.elapsed() > self.ttl => {
                inner.dir_listings.remove(path);
                None
            }
            Some((listing, _)) => {
                trace!("listing cache hit: {path}");
                Some(listing.clone())
            }
            None => None,
        }
    }

    pub fn put_listing(&self, path: &str, entries: Vec<String>) {
        let mut inner = self.inner.lock();
        inner
            .dir_listings
            .insert(path.to_string(), (entries, Instant::now()));
    }

    /// Drop cached attributes for a path
    pub fn invalidate(&self, path: &str) {
        if self.inner.lock().file_attrs.remove(path).is_some() {
            debug!("invalidated attrs: {path}");
        }
    }

    /// Drop the cached listing for a directory
    pub fn invalidate_listing(&self, path: &str) {
        if self.inner.lock().dir_listings.remove(path).is_some() {
            debug!("invalidated listing: {path}");
        }
    }

    /// Remove all expired entries
    pub fn sweep_expired(&self) {
        let mut inner = self.inner.lock();
        let ttl = self.ttl;
        let before = inner.file_attrs.len() + inner.dir_listings.len();
        inner.file_attrs.retain(|_, (_, t)| t.elapsed() <= ttl);
        inner.dir_listings.retain(|_, (_, t)| t.elapsed() <= ttl);
        let removed = before - inner.file_attrs.len() - inner.dir_listings.len();
        if removed > 0 {
            debug!("swept {removed} expired metadata entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteEntry;

    fn attrs(path: &str, size: u64) -> RemoteEntry {
        let name = path.rsplit('/').next().unwrap().to_string();
        RemoteEntry::file(name, path, size, 1_700_000_000)
    }

    #[test]
    fn test_put_get_invalidate() {
        let cache = MetadataCache::new(Duration::from_secs(60));

        cache.put_attrs("/a.txt", attrs("/a.txt", 5));
        assert_eq!(cache.get_attrs("/a.txt").unwrap().size, 5);

        cache.invalidate("/a.txt");
        assert!(cache.get_attrs("/a.txt").is_none());
    }

    #[test]
    fn test_listing_cache() {
        let cache = MetadataCache::new(Duration::from_secs(60));

        let entries = vec!["a.txt".to_string(), "b.txt".to_string()];
        cache.put_listing("/", entries.clone());
        assert_eq!(cache.get_listing("/").unwrap(), entries);

        cache.invalidate_listing("/");
        assert!(cache.get_listing("/").is_none());
    }

    #[test]
    fn test_expiry_removes_on_read() {
        let cache = MetadataCache::new(Duration::from_millis(10));

        cache.put_attrs("/a.txt", attrs("/a.txt", 5));
        cache.put_listing("/", vec!["a.txt".to_string()]);
        std::thread::sleep(Duration::from_millis(30));

        assert!(cache.get_attrs("/a.txt").is_none());
        assert!(cache.get_listing("/").is_none());
    }

    #[test]
    fn test_sweep_expired() {
        let cache = MetadataCache::new(Duration::from_millis(10));

        cache.put_attrs("/old.txt", attrs("/old.txt", 1));
        std::thread::sleep(Duration::from_millis(30));
        cache.put_attrs("/new.txt", attrs("/new.txt", 2));

        cache.sweep_expired();
        assert!(cache.inner.lock().file_attrs.contains_key("/new.txt"));
        assert!(!cache.inner.lock().file_attrs.contains_key("/old.txt"));
    }
}
