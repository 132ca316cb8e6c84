use crate::error::{Error, Result};
use crate::mount::MountSource;
use crate::snapshot::{validate_name, Snapshot, SnapshotView};
use crate::tool::{ToolCommand, ToolRunner};
use std::path::{Path, PathBuf};
use tracing::info;

/// Filesystem type reported by `stat -f` for btrfs.
pub const BTRFS_FSTYPE: &str = "btrfs";

/// Location of a btrfs source within its filesystem.
#[derive(Debug)]
struct SourceLocation {
    /// Block device backing the filesystem.
    device: PathBuf,
    /// Subvolume mounted at `mount_point`, if not the top-level one.
    subvolume: Option<String>,
    /// Where the subvolume holding the source is mounted. The snapshot is
    /// created directly below it.
    mount_point: PathBuf,
}

/// Read-only snapshot of the subvolume holding the source.
pub struct BtrfsSnapshot<'a> {
    runner: &'a dyn ToolRunner,
    source: PathBuf,
    name: String,
    location: SourceLocation,
}

impl<'a> BtrfsSnapshot<'a> {
    /// Fails with [`Error::Validation`] if `source` is not on btrfs.
    pub fn new(runner: &'a dyn ToolRunner, source: &Path, name: String) -> Result<Self> {
        let fstype = runner.run_checked(
            &ToolCommand::new("stat")
                .args(["-f", "-c", "%T"])
                .arg(source),
        )?;
        if fstype.stdout.trim() != BTRFS_FSTYPE {
            return Err(Error::Validation(format!(
                "{} is not on a btrfs filesystem",
                source.display()
            )));
        }
        validate_name(&name)?;

        let findmnt = |column: &str| {
            runner
                .run_checked(
                    &ToolCommand::new("findmnt")
                        .args(["-n", "-o", column, "-T"])
                        .arg(source),
                )
                .map(|output| output.stdout.trim().to_owned())
        };
        let (device, subvolume) = parse_mount_source(&findmnt("SOURCE")?)?;
        let mount_point = PathBuf::from(findmnt("TARGET")?);

        Ok(Self {
            runner,
            source: source.to_path_buf(),
            name,
            location: SourceLocation {
                device,
                subvolume,
                mount_point,
            },
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.location.mount_point.join(&self.name)
    }

    /// Subvolume path of the snapshot relative to the filesystem root,
    /// as `mount -o subvol=` expects it.
    pub fn subvolume_selector(&self) -> String {
        match &self.location.subvolume {
            Some(parent) => format!("{}/{}", parent.trim_end_matches('/'), self.name),
            None => self.name.clone(),
        }
    }
}

impl Snapshot for BtrfsSnapshot<'_> {
    fn describe(&self) -> String {
        format!("snapshot {} of {}", self.name, self.source.display())
    }

    fn create(&mut self) -> Result<SnapshotView> {
        info!("Creating {}", self.describe());
        self.runner.run_checked(
            &ToolCommand::new("btrfs")
                .args(["subvolume", "snapshot", "-r"])
                .arg(&self.source)
                .arg(self.snapshot_path()),
        )?;
        info!("Created {}", self.describe());

        Ok(SnapshotView::Mountable(MountSource {
            device: self.location.device.clone(),
            options: Some(format!("subvol={}", self.subvolume_selector())),
        }))
    }

    fn destroy(&mut self) -> Result<()> {
        info!("Deleting {}", self.describe());
        self.runner.run_checked(
            &ToolCommand::new("btrfs")
                .args(["subvolume", "delete"])
                .arg(self.snapshot_path()),
        )?;
        info!("Deleted {}", self.describe());
        Ok(())
    }
}

/// Splits a findmnt `SOURCE` column such as `/dev/sda2[/@home]` into the
/// device and the mounted subvolume.
fn parse_mount_source(source: &str) -> Result<(PathBuf, Option<String>)> {
    let (device, subvolume) = match source.split_once('[') {
        Some((device, rest)) => {
            let subvolume = rest.trim_end_matches(']').trim();
            (device.trim(), Some(subvolume.to_owned()))
        }
        None => (source.trim(), None),
    };
    if device.is_empty() {
        return Err(Error::Validation(format!(
            "cannot determine backing device from {source:?}"
        )));
    }
    Ok((PathBuf::from(device), subvolume))
}
