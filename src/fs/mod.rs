pub mod driver;
pub mod inode;

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::Result;
use crate::remote::{EntryKind, RemoteClient, RemoteEntry};

pub use self::driver::Driver;
use self::inode::{InodeTable, ROOT_INODE};

/// TTL for attribute replies to the kernel (1 second)
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

/// Block size for reporting
const BLOCK_SIZE: u32 = 4096;

/// Bound on waiting for the background worker at unmount
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Convert driver attributes to a FUSE attr record
fn entry_to_attr(ino: u64, entry: &RemoteEntry, uid: u32, gid: u32) -> FileAttr {
    let kind = match entry.kind {
        EntryKind::Directory => FuseFileType::Directory,
        EntryKind::File => FuseFileType::RegularFile,
    };
    let perm = if entry.is_dir() { 0o755 } else { 0o644 };
    let nlink = if entry.is_dir() { 2 } else { 1 };
    let mtime = UNIX_EPOCH + Duration::from_secs(entry.mtime.max(0) as u64);

    FileAttr {
        ino,
        size: entry.size,
        blocks: entry.size.div_ceil(BLOCK_SIZE as u64),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm,
        nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn child_path(parent: &str, name: &OsStr) -> String {
    let name = name.to_string_lossy();
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// FUSE filesystem that delegates to the driver
pub struct CloudMountFs {
    driver: Arc<Driver>,
    inodes: InodeTable,
    /// Dedicated runtime: kernel threads block on it while the queue and
    /// the background sync loop run inside it
    runtime: tokio::runtime::Runtime,
    worker: Option<JoinHandle<()>>,
    uid: u32,
    gid: u32,
}

impl CloudMountFs {
    pub fn new(config: Config, remote: Arc<dyn RemoteClient>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()?;

        let driver = Driver::new(config, remote)?;
        let worker = runtime.spawn(driver.clone().run_background());

        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        Ok(Self {
            driver,
            inodes: InodeTable::new(),
            runtime,
            worker: Some(worker),
            uid,
            gid,
        })
    }

    pub fn config(&self) -> &Config {
        self.driver.config()
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    fn inode_to_path(&self, ino: u64) -> std::result::Result<String, i32> {
        self.inodes.get_path(ino).ok_or(libc::ENOENT)
    }

    /// Run a driver future on the dedicated runtime and wait for it
    fn run_async<F, T>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.runtime.block_on(future)
    }
}

impl Filesystem for CloudMountFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_path = match self.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let path = child_path(&parent_path, name);
        trace!("lookup: {path}");

        match self.run_async(self.driver.getattr(&path)) {
            Ok(entry) => {
                let ino = self.inodes.get_or_create(&path);
                reply.entry(&ATTR_TTL, &entry_to_attr(ino, &entry, self.uid, self.gid), GENERATION);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("getattr: {path} (ino={ino})");

        match self.run_async(self.driver.getattr(&path)) {
            Ok(entry) => reply.attr(&ATTR_TTL, &entry_to_attr(ino, &entry, self.uid, self.gid)),
            Err(e) => {
                debug!("getattr error for {path}: {e}");
                reply.error(e.to_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        if let Some(new_size) = size {
            trace!("setattr truncate: {path} to {new_size} bytes");
            if let Err(e) = self.driver.truncate(&path, new_size, fh) {
                error!("truncate error for {path}: {e}");
                reply.error(e.to_errno());
                return;
            }
        }

        // Mode/owner/time changes are not persisted; report current attrs
        self.getattr(req, ino, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let path = child_path(&parent_path, name);

        match self.run_async(self.driver.mkdir(&path)) {
            Ok(entry) => {
                let ino = self.inodes.get_or_create(&path);
                reply.entry(&ATTR_TTL, &entry_to_attr(ino, &entry, self.uid, self.gid), GENERATION);
            }
            Err(e) => {
                error!("mkdir error for {path}: {e}");
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_path = match self.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let path = child_path(&parent_path, name);

        match self.run_async(self.driver.unlink(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => {
                error!("unlink error for {path}: {e}");
                reply.error(e.to_errno());
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_path = match self.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let path = child_path(&parent_path, name);

        match self.run_async(self.driver.rmdir(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => {
                error!("rmdir error for {path}: {e}");
                reply.error(e.to_errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old_parent, new_parent) =
            match (self.inode_to_path(parent), self.inode_to_path(newparent)) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(e), _) | (_, Err(e)) => {
                    reply.error(e);
                    return;
                }
            };
        let old_path = child_path(&old_parent, name);
        let new_path = child_path(&new_parent, newname);

        match self.run_async(self.driver.rename(&old_path, &new_path)) {
            Ok(()) => {
                self.inodes.rename_path(&old_path, &new_path);
                reply.ok();
            }
            Err(e) => {
                error!("rename error {old_path} -> {new_path}: {e}");
                reply.error(e.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("open: {path} flags={flags:#x}");

        match self.run_async(self.driver.open(&path, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => {
                error!("open error for {path}: {e}");
                reply.error(e.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let parent_path = match self.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let path = child_path(&parent_path, name);
        debug!("create: {path}");

        let fh = match self.driver.create(&path) {
            Ok(fh) => fh,
            Err(e) => {
                error!("create error for {path}: {e}");
                reply.error(e.to_errno());
                return;
            }
        };

        match self.run_async(self.driver.getattr(&path)) {
            Ok(entry) => {
                let ino = self.inodes.get_or_create(&path);
                reply.created(
                    &ATTR_TTL,
                    &entry_to_attr(ino, &entry, self.uid, self.gid),
                    GENERATION,
                    fh,
                    0,
                );
            }
            Err(e) => {
                self.driver.release(fh);
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read: ino={ino} fh={fh} offset={offset} size={size}");

        match self.driver.read(fh, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read error (fh={fh}): {e}");
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write: ino={ino} fh={fh} offset={offset} size={}", data.len());

        match self.driver.write(fh, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => {
                error!("write error (fh={fh}): {e}");
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!("flush: ino={ino} fh={fh}");
        // Upload failures are absorbed; the background sync retries
        self.run_async(self.driver.flush(fh));
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        trace!("fsync: ino={ino} fh={fh}");
        self.run_async(self.driver.fsync(fh));
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // No upload here: durability comes from fsync and the background
        // sync loop
        self.driver.release(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("readdir: {path} offset={offset}");

        let entries = match self.run_async(self.driver.readdir(&path)) {
            Ok(entries) => entries,
            Err(e) => {
                error!("readdir error for {path}: {e}");
                reply.error(e.to_errno());
                return;
            }
        };

        let mut idx = 0i64;

        if offset <= idx && reply.add(ino, idx + 1, FuseFileType::Directory, ".") {
            reply.ok();
            return;
        }
        idx += 1;

        if offset <= idx {
            let parent_ino = if ino == ROOT_INODE {
                ROOT_INODE
            } else {
                self.inodes
                    .get_inode(driver::parent_dir(&path))
                    .unwrap_or(ROOT_INODE)
            };
            if reply.add(parent_ino, idx + 1, FuseFileType::Directory, "..") {
                reply.ok();
                return;
            }
        }
        idx += 1;

        for entry in entries {
            if offset <= idx {
                let entry_ino = self.inodes.get_or_create(&entry.path);
                let kind = match entry.kind {
                    EntryKind::Directory => FuseFileType::Directory,
                    EntryKind::File => FuseFileType::RegularFile,
                };
                if reply.add(entry_ino, idx + 1, kind, &entry.name) {
                    // Buffer full
                    reply.ok();
                    return;
                }
            }
            idx += 1;
        }

        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.run_async(self.driver.getattr(&path)) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(
            u64::MAX,   // blocks
            u64::MAX,   // bfree
            u64::MAX,   // bavail
            u64::MAX,   // files
            u64::MAX,   // ffree
            BLOCK_SIZE, // bsize
            255,        // namelen
            BLOCK_SIZE, // frsize
        );
    }

    fn destroy(&mut self) {
        info!("filesystem unmounting, stopping background worker");
        self.driver.shutdown();

        if let Some(worker) = self.worker.take() {
            let joined = self
                .runtime
                .block_on(async { tokio::time::timeout(SHUTDOWN_TIMEOUT, worker).await });
            if joined.is_err() {
                warn!("background worker did not stop within {SHUTDOWN_TIMEOUT:?}");
            }
        }

        let dirty = self.driver.data_cache().stats().dirty_entries;
        if dirty > 0 {
            warn!("{dirty} modified files were not uploaded; they remain cached for the next mount");
        }
        info!("filesystem cleanup completed");
    }
}
