pub mod s3;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// Entry type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Attributes of a remote file or directory
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    /// Base name of the entry
    pub name: String,
    /// Absolute remote path
    pub path: String,
    pub kind: EntryKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Modification time, seconds since the Unix epoch
    pub mtime: i64,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, path: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: EntryKind::File,
            size,
            mtime,
        }
    }

    pub fn directory(name: impl Into<String>, path: impl Into<String>, mtime: i64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: EntryKind::Directory,
            size: 0,
            mtime,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }
}

/// Contract over the remote object store.
///
/// Implementations are path-based and transfer whole files between a local
/// path and a remote path. Two error variants carry protocol meaning:
/// `CloudMountError::NotFound` when the remote object is absent, and
/// `CloudMountError::Conflict` when an upload targets a path that already
/// exists.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// List the entries of a remote directory.
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Upload a local file to a remote path.
    ///
    /// Fails with `Conflict` if the target already exists.
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Download a remote file to a local path.
    async fn download(&self, remote: &str, local: &Path) -> Result<()>;

    /// Create a remote directory.
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Delete a remote file or directory.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Rename/move a remote file or directory.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}
