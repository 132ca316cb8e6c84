use crate::error::{Error, Result};
use crate::mount::MountSource;
use crate::snapshot::{validate_name, Snapshot, SnapshotView};
use crate::tool::{ToolCommand, ToolRunner};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Default copy-on-write space reserved for a snapshot, in GiB.
pub const DEFAULT_COW_SIZE_GIB: u32 = 64;

/// Space allocated to a logical volume snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSize {
    /// Thin snapshot; only valid on thin-provisioned volumes.
    Thin,
    /// Classic copy-on-write snapshot with a fixed size in GiB.
    Gib(NonZeroU32),
}

impl SnapshotSize {
    /// Zero means a thin snapshot.
    pub fn from_gib(gib: u32) -> Self {
        NonZeroU32::new(gib).map_or(Self::Thin, Self::Gib)
    }

    fn size_arg(self) -> Option<String> {
        match self {
            Self::Thin => None,
            Self::Gib(gib) => Some(format!("-L{gib}G")),
        }
    }
}

impl Default for SnapshotSize {
    fn default() -> Self {
        Self::from_gib(DEFAULT_COW_SIZE_GIB)
    }
}

/// Snapshot of an LVM logical volume.
pub struct LvmSnapshot<'a> {
    runner: &'a dyn ToolRunner,
    volume: PathBuf,
    volume_group: String,
    name: String,
    size: SnapshotSize,
}

impl<'a> LvmSnapshot<'a> {
    /// Validates the snapshot with a dry run of `lvcreate`.
    pub fn new(
        runner: &'a dyn ToolRunner,
        volume: &Path,
        name: String,
        size: SnapshotSize,
    ) -> Result<Self> {
        validate_name(&name)?;
        let volume_group = volume_group_of(volume)?;

        let snapshot = Self {
            runner,
            volume: volume.to_path_buf(),
            volume_group,
            name,
            size,
        };

        info!("Checking if creating {} is possible", snapshot.describe());
        snapshot
            .runner
            .run_checked(&snapshot.lvcreate().arg("--test"))
            .map_err(|e| match e {
                Error::ExternalTool { stderr, .. } => Error::Validation(format!(
                    "cannot create {}: {}",
                    snapshot.describe(),
                    stderr.trim()
                )),
                other => other,
            })?;
        info!("{} is possible", snapshot.describe());

        Ok(snapshot)
    }

    pub fn volume_group(&self) -> &str {
        &self.volume_group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<volume group>/<snapshot name>`, as the LVM tools address it.
    fn qualified_name(&self) -> String {
        format!("{}/{}", self.volume_group, self.name)
    }

    pub fn device_path(&self) -> PathBuf {
        Path::new("/dev").join(&self.volume_group).join(&self.name)
    }

    fn lvcreate(&self) -> ToolCommand {
        let command = ToolCommand::new("lvcreate")
            .args(["--name", self.name.as_str(), "--snapshot"])
            .arg(&self.volume);
        match self.size.size_arg() {
            Some(size) => command.arg(size),
            None => command,
        }
    }

    fn remove(&self) -> Result<()> {
        self.runner.run_checked(
            &ToolCommand::new("lvremove")
                .arg("-f")
                .arg(self.qualified_name()),
        )?;
        Ok(())
    }
}

impl Snapshot for LvmSnapshot<'_> {
    fn describe(&self) -> String {
        format!("snapshot {} of volume {}", self.name, self.volume.display())
    }

    fn create(&mut self) -> Result<SnapshotView> {
        info!("Creating {}", self.describe());
        self.runner.run_checked(&self.lvcreate())?;

        // Snapshots of thin volumes are created inactive; activation
        // makes the device node appear.
        let activate = ToolCommand::new("lvchange")
            .args(["-ay", "-y"])
            .arg(self.qualified_name());
        if let Err(e) = self.runner.run_checked(&activate) {
            if let Err(remove_err) = self.remove() {
                error!("Failed to remove {}: {remove_err}", self.describe());
            }
            return Err(e);
        }
        info!("Created {}", self.describe());

        Ok(SnapshotView::Mountable(MountSource {
            device: self.device_path(),
            options: None,
        }))
    }

    fn destroy(&mut self) -> Result<()> {
        info!("Deleting {}", self.describe());
        self.remove()?;
        info!("Deleted {}", self.describe());
        Ok(())
    }
}

/// The volume group is the second-to-last segment of a volume path such
/// as `/dev/<group>/<volume>`.
fn volume_group_of(volume: &Path) -> Result<String> {
    let invalid = || Error::Validation(format!("not a logical volume path: {}", volume.display()));
    let text = volume.to_str().ok_or_else(invalid)?;
    let segments: Vec<&str> = text.split('/').collect();
    match segments.len().checked_sub(2).map(|i| segments[i]) {
        Some(group) if !group.is_empty() => Ok(group.to_owned()),
        _ => Err(invalid()),
    }
}
