//! cloudmount: mount remote object storage as a local filesystem
//!
//! This library exposes a remote object-storage drive as a mounted POSIX
//! filesystem via FUSE. File operations are served from a write-back local
//! cache; uploads and downloads run through a bounded, deduplicated
//! operation queue on a background runtime.
//!
//! # Architecture
//!
//! - **RemoteClient**: the storage backend contract (list, upload, download,
//!   mkdir, delete, rename) with tagged `NotFound`/`Conflict` errors. An S3
//!   implementation is provided.
//! - **Caches**: a TTL-bounded metadata cache and a disk-backed LRU data
//!   cache with dirty tracking that survives restarts.
//! - **OperationQueue**: priority-ordered, deduplicated transfer queues with
//!   concurrency limits, retry, and synchronous waitable uploads.
//! - **Filesystem driver**: translates POSIX calls into cache and queue
//!   operations, including the fsync-driven durability protocol.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use cloudmount::config::Config;
//! use cloudmount::fs::CloudMountFs;
//! use cloudmount::mount;
//! use cloudmount::remote::s3::S3RemoteClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file(Path::new("config.yaml"))?;
//! let remote = Arc::new(S3RemoteClient::new(config.s3.clone()).await?);
//! let fs = CloudMountFs::new(config, remote)?;
//! let _session = mount::mount_background(fs, Path::new("/mnt/drive"))?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod mount;
pub mod queue;
pub mod remote;

pub use error::{CloudMountError, Result};
