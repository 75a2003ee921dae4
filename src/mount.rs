//! Mount lifecycle

use std::path::{Path, PathBuf};

use fuser::MountOption;
use tracing::info;

use crate::config::Config;
use crate::error::{CloudMountError, Result};
use crate::fs::CloudMountFs;

/// Represents an active mount
pub struct ActiveMount {
    /// Mount path
    pub path: PathBuf,
    /// Session handle (for unmounting)
    session: Option<fuser::BackgroundSession>,
}

impl ActiveMount {
    /// Unmount this filesystem
    pub fn unmount(&mut self) {
        if let Some(session) = self.session.take() {
            info!("unmounting {:?}", self.path);
            drop(session);
        }
    }
}

impl Drop for ActiveMount {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Build the FUSE mount options for a configuration
pub fn mount_options(config: &Config) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("cloudmount".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

fn validate_mountpoint(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(CloudMountError::NotFound(format!(
            "mount point does not exist: {path:?}"
        )));
    }
    if !path.is_dir() {
        return Err(CloudMountError::InvalidPath(format!(
            "mount point is not a directory: {path:?}"
        )));
    }
    Ok(())
}

/// Mount in the background, returning a session handle that unmounts on drop
pub fn mount_background(fs: CloudMountFs, mountpoint: &Path) -> Result<ActiveMount> {
    validate_mountpoint(mountpoint)?;
    let options = mount_options(fs.config());

    info!("mounting at {mountpoint:?}");
    let session =
        fuser::spawn_mount2(fs, mountpoint, &options).map_err(CloudMountError::Io)?;
    info!("successfully mounted at {mountpoint:?}");

    Ok(ActiveMount {
        path: mountpoint.to_path_buf(),
        session: Some(session),
    })
}

/// Mount and block the calling thread until the filesystem is unmounted
pub fn mount_foreground(fs: CloudMountFs, mountpoint: &Path) -> Result<()> {
    validate_mountpoint(mountpoint)?;
    let options = mount_options(fs.config());

    info!("mounting at {mountpoint:?}");
    fuser::mount2(fs, mountpoint, &options).map_err(CloudMountError::Io)
}
