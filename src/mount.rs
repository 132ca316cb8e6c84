//! Read-only mounts of snapshot devices on temporary directories.

use crate::error::{Error, Result};
use crate::path;
use crate::tool::{ToolCommand, ToolRunner};
use fs_err as fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Prefix of the temporary mount point directories.
const MOUNTPOINT_PREFIX: &str = "borgsnap-";

/// Filesystems that refuse to mount a second volume carrying the UUID of
/// one already mounted, which a snapshot always does.
const NOUUID_FSTYPES: &[&str] = &["xfs"];

/// A device to mount, with extra backend-specific mount options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSource {
    pub device: PathBuf,
    pub options: Option<String>,
}

/// A mounted snapshot, unmounted by [`Mount::unmount`].
///
/// The mount point is a fresh temporary directory owned by this value.
/// It is only ever removed non-recursively, so a mount that failed to go
/// away can never have its contents deleted. A `Mount` dropped without
/// being unmounted unmounts itself and logs any failure.
pub struct Mount<'a> {
    runner: &'a dyn ToolRunner,
    mountpoint: PathBuf,
    released: bool,
}

impl<'a> Mount<'a> {
    pub fn new(runner: &'a dyn ToolRunner, source: &MountSource) -> Result<Self> {
        let device = &source.device;
        if !path::exists(device) {
            return Err(Error::NotFound(device.clone()));
        }
        let fstype = filesystem_type(runner, device)?;

        let mountpoint = tempfile::Builder::new()
            .prefix(MOUNTPOINT_PREFIX)
            .tempdir()?
            .keep();
        let options = mount_options(&fstype, source.options.as_deref());

        info!("Mounting {} to {}", device.display(), mountpoint.display());
        let command = ToolCommand::new("mount")
            .arg("-o")
            .arg(&options)
            .arg(device)
            .arg(&mountpoint);
        if let Err(e) = runner.run_checked(&command) {
            remove_mountpoint(&mountpoint);
            return Err(e);
        }
        info!("Mounted {} to {}", device.display(), mountpoint.display());

        Ok(Self {
            runner,
            mountpoint,
            released: false,
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts and removes the mount point.
    ///
    /// The directory is removed even if `umount` fails; only the
    /// `umount` failure is reported.
    pub fn unmount(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        info!("Unmounting {}", self.mountpoint.display());
        let unmounted = self
            .runner
            .run_checked(&ToolCommand::new("umount").arg(&self.mountpoint));
        remove_mountpoint(&self.mountpoint);
        unmounted?;
        info!("Unmounted {}", self.mountpoint.display());
        Ok(())
    }
}

impl Drop for Mount<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release() {
            error!("Failed to unmount {}: {e}", self.mountpoint.display());
        }
    }
}

/// Filesystem type of `device` as reported by `lsblk`; empty if unknown.
fn filesystem_type(runner: &dyn ToolRunner, device: &Path) -> Result<String> {
    let output = runner.run_checked(
        &ToolCommand::new("lsblk")
            .args(["-f", "-o", "FSTYPE"])
            .arg(device),
    )?;
    let fstype = output
        .stdout
        .lines()
        .skip(1)
        .last()
        .map(str::trim)
        .unwrap_or_default();
    debug!("{} has filesystem type {fstype:?}", device.display());
    Ok(fstype.to_owned())
}

fn mount_options(fstype: &str, extra: Option<&str>) -> String {
    let mut options = String::from("ro");
    if NOUUID_FSTYPES.contains(&fstype) {
        options.push_str(",nouuid");
    }
    if let Some(extra) = extra.filter(|e| !e.is_empty()) {
        options.push(',');
        options.push_str(extra);
    }
    options
}

fn remove_mountpoint(mountpoint: &Path) {
    match fs::remove_dir(mountpoint) {
        Ok(()) => info!("Deleted {}", mountpoint.display()),
        Err(e) => warn!("Failed to clean up {}: {e}", mountpoint.display()),
    }
}
