//! Inode management for path <-> inode mapping
//!
//! The FUSE interface works with numeric inodes while the driver works
//! with remote paths. Inode numbers are derived from a stable hash of
//! the path truncated to 31 bits; the table keeps the reverse mapping.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

/// Root directory inode (always 1 in FUSE)
pub const ROOT_INODE: u64 = 1;

/// Stable 31-bit inode derived from the path
fn path_inode(path: &str) -> u64 {
    let digest = Sha256::digest(path.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let ino = u64::from_be_bytes(bytes) & 0x7FFF_FFFF;
    // Avoid the reserved root inode and zero
    ino.max(ROOT_INODE + 1)
}

/// Manages bidirectional inode <-> path mapping
pub struct InodeTable {
    inode_to_path: DashMap<u64, String>,
    path_to_inode: DashMap<String, u64>,
    /// Fallback allocator for the rare hash collision, above the 31-bit range
    overflow: AtomicU64,
}

impl InodeTable {
    /// Create a new inode table with the root directory pre-registered
    pub fn new() -> Self {
        let table = Self {
            inode_to_path: DashMap::new(),
            path_to_inode: DashMap::new(),
            overflow: AtomicU64::new(1 << 31),
        };
        table.inode_to_path.insert(ROOT_INODE, "/".to_string());
        table.path_to_inode.insert("/".to_string(), ROOT_INODE);
        table
    }

    /// Get the inode for a path, registering one if it doesn't exist
    pub fn get_or_create(&self, path: &str) -> u64 {
        if let Some(ino) = self.path_to_inode.get(path) {
            return *ino;
        }

        let candidate = path_inode(path);
        let ino = match self.inode_to_path.entry(candidate) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(path.to_string());
                candidate
            }
            dashmap::mapref::entry::Entry::Occupied(existing) if existing.get().as_str() == path => {
                candidate
            }
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Two paths hashed to the same 31-bit value
                let fallback = self.overflow.fetch_add(1, Ordering::SeqCst);
                self.inode_to_path.insert(fallback, path.to_string());
                fallback
            }
        };

        // Another thread may have registered the path concurrently; the
        // first insertion wins
        *self
            .path_to_inode
            .entry(path.to_string())
            .or_insert(ino)
            .value()
    }

    /// Get the path for an inode
    pub fn get_path(&self, ino: u64) -> Option<String> {
        self.inode_to_path.get(&ino).map(|p| p.clone())
    }

    /// Get the inode for a path (without registering)
    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(path).map(|i| *i)
    }

    /// Remove the mapping for a path
    pub fn remove_path(&self, path: &str) {
        if let Some((_, ino)) = self.path_to_inode.remove(path) {
            self.inode_to_path.remove(&ino);
        }
    }

    /// Move a mapping to a new path, keeping the inode number
    pub fn rename_path(&self, old: &str, new: &str) {
        if let Some((_, ino)) = self.path_to_inode.remove(old) {
            self.inode_to_path.insert(ino, new.to_string());
            self.path_to_inode.insert(new.to_string(), ino);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
