use std::io;
use thiserror::Error;

/// Main error type for cloudmount operations
#[derive(Error, Debug)]
pub enum CloudMountError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    Conflict(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Unknown file handle: {0}")]
    BadHandle(u64),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote replacement stranded: temporary {temp} exists, target {target} is missing")]
    ReplacementStranded { temp: String, target: String },
}

impl CloudMountError {
    /// Convert error to libc errno for FUSE responses
    pub fn to_errno(&self) -> i32 {
        match self {
            CloudMountError::NotFound(_) => libc::ENOENT,
            CloudMountError::Conflict(_) => libc::EEXIST,
            CloudMountError::InvalidPath(_) => libc::EINVAL,
            CloudMountError::BadHandle(_) => libc::EBADF,
            CloudMountError::PermissionDenied => libc::EACCES,
            CloudMountError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            CloudMountError::Backend(_) => libc::EIO,
            CloudMountError::Cache(_) => libc::EIO,
            CloudMountError::Config(_) => libc::EINVAL,
            CloudMountError::ReplacementStranded { .. } => libc::EIO,
        }
    }
}

/// Result type alias for cloudmount operations
pub type Result<T> = std::result::Result<T, CloudMountError>;
