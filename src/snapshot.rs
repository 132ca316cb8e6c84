use crate::error::{Error, Result};
use crate::mount::MountSource;
use crate::tool::ToolRunner;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{error, info};

pub mod btrfs;
pub mod lvm;
pub mod none;

pub use btrfs::BtrfsSnapshot;
pub use lvm::{LvmSnapshot, SnapshotSize};
pub use none::NoSnapshot;

/// Prefix of generated snapshot names.
pub const SNAPSHOT_NAME_PREFIX: &str = "bkmgrsnap";

static SNAPSHOT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9]+$").expect("valid regex"));

/// Returns a fresh snapshot name with a full 128-bit random suffix,
/// so concurrent runs never pick the same name.
pub fn generate_name() -> String {
    let random_bytes: [u8; 16] = rand::random();
    format!("{SNAPSHOT_NAME_PREFIX}{}", hex::encode(random_bytes))
}

fn validate_name(name: &str) -> Result<()> {
    if SNAPSHOT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid snapshot name: {name:?}")))
    }
}

/// What a created snapshot exposes to be backed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotView {
    /// A device that has to be mounted before its contents can be read.
    Mountable(MountSource),
    /// A directory that can be archived as it is.
    Direct(PathBuf),
}

/// A point-in-time snapshot mechanism.
///
/// Constructing an implementation only checks that a snapshot is
/// feasible and must not change anything on the host. [`Snapshot::create`]
/// does the actual work. Once `create` has succeeded, [`Snapshot::destroy`]
/// is called exactly once; [`ActiveSnapshot`] enforces that pairing.
pub trait Snapshot {
    /// Human-readable identity for log messages.
    fn describe(&self) -> String;

    fn create(&mut self) -> Result<SnapshotView>;

    fn destroy(&mut self) -> Result<()>;
}

/// How the backup run should obtain a consistent view of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotMode {
    /// Back up the source path as it is.
    Disabled,
    /// Use a btrfs snapshot if the source supports one, otherwise back up
    /// the source path directly.
    #[default]
    Auto,
    /// Snapshot the source logical volume. Infeasibility is a hard error.
    Lvm(SnapshotSize),
}

/// Picks and validates the backend for `mode`.
pub fn select<'a>(
    runner: &'a dyn ToolRunner,
    mode: SnapshotMode,
    source: &Path,
) -> Result<Box<dyn Snapshot + 'a>> {
    match mode {
        SnapshotMode::Disabled => Ok(Box::new(NoSnapshot::new(source))),
        SnapshotMode::Lvm(size) => Ok(Box::new(LvmSnapshot::new(
            runner,
            source,
            generate_name(),
            size,
        )?)),
        SnapshotMode::Auto => match BtrfsSnapshot::new(runner, source, generate_name()) {
            Ok(snapshot) => Ok(Box::new(snapshot)),
            Err(e) if e.is_infeasible() => {
                info!("BTRFS snapshot not available: {e}");
                Ok(Box::new(NoSnapshot::new(source)))
            }
            Err(e) => Err(e),
        },
    }
}

/// A created snapshot, destroyed by [`ActiveSnapshot::release`].
///
/// If dropped without being released (e.g. while unwinding from a
/// panic), the snapshot is still destroyed and any failure is logged.
pub struct ActiveSnapshot<'a> {
    backend: &'a mut dyn Snapshot,
    view: SnapshotView,
    released: bool,
}

impl<'a> ActiveSnapshot<'a> {
    pub fn create(backend: &'a mut dyn Snapshot) -> Result<Self> {
        let view = backend.create()?;
        Ok(Self {
            backend,
            view,
            released: false,
        })
    }

    pub fn view(&self) -> &SnapshotView {
        &self.view
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.backend.destroy()
    }
}

impl Drop for ActiveSnapshot<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.backend.destroy() {
            error!("Failed to destroy {}: {e}", self.backend.describe());
        }
    }
}
