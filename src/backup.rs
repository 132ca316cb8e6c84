//! This module runs one backup of a live filesystem into the current
//! destination of a backup root.
//!
//! Resources are acquired in a fixed nesting: repository lock, then
//! snapshot, then mount. They are released in exactly the reverse order
//! on every path out of a run. When the archiver or an inner release
//! fails, the outer releases still run, and the first failure is the
//! one reported.

use crate::archive::{validate_archive_name, Archiver, Outcome};
use crate::error::{Error, Result};
use crate::mount::{Mount, MountSource};
use crate::path;
use crate::repository::{self, RepositoryLock};
use crate::snapshot::{self, ActiveSnapshot, SnapshotMode, SnapshotView};
use crate::tool::ToolRunner;
use crate::DEFAULT_ARCHIVE_NAME;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory to back up, or the logical volume for LVM snapshots.
    pub source: PathBuf,
    /// Directory holding the lock file and the destinations.
    pub backup_root: PathBuf,
    pub snapshot: SnapshotMode,
    /// Start a new destination even if one is current.
    pub create_repository: bool,
    /// Archive name handed to the archiver, which expands any placeholders.
    pub archive_name: String,
}

impl Config {
    pub fn new(source: impl Into<PathBuf>, backup_root: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            backup_root: backup_root.into(),
            snapshot: SnapshotMode::default(),
            create_repository: false,
            archive_name: DEFAULT_ARCHIVE_NAME.to_owned(),
        }
    }
}

pub fn run(config: &Config, runner: &dyn ToolRunner, archiver: &dyn Archiver) -> Result<()> {
    validate_archive_name(&config.archive_name)?;

    if config.create_repository {
        repository::create_destination(&config.backup_root, archiver)?;
    }
    let lock = RepositoryLock::resolve(&config.backup_root, archiver)?;
    let driver = Driver {
        config,
        runner,
        archiver,
        repository: lock.destination_path(),
    };
    driver.check_paths()?;

    let result = driver.run();
    drop(lock);
    if result.is_ok() {
        info!("Backup complete");
    }
    result
}

struct Driver<'a> {
    config: &'a Config,
    runner: &'a dyn ToolRunner,
    archiver: &'a dyn Archiver,
    repository: PathBuf,
}

impl<'a> Driver<'a> {
    fn check_paths(&self) -> Result<()> {
        if !path::exists(&self.repository) {
            return Err(Error::NotFound(self.repository.clone()));
        }
        if !path::exists(&self.config.source) {
            return Err(Error::NotFound(self.config.source.clone()));
        }
        if path::is_empty_dir(&self.repository)? {
            return Err(Error::Validation(format!(
                "destination {} is not initialized",
                self.repository.display()
            )));
        }
        Ok(())
    }

    fn run(&self) -> Result<()> {
        let mut backend = snapshot::select(self.runner, self.config.snapshot, &self.config.source)?;
        let snapshot = ActiveSnapshot::create(&mut *backend)?;

        let archived = match snapshot.view() {
            SnapshotView::Direct(dir) => self.archive(dir),
            SnapshotView::Mountable(source) => self.archive_mounted(source),
        };
        unwind(archived, snapshot.release(), "snapshot")
    }

    fn archive_mounted(&self, source: &MountSource) -> Result<()> {
        let mount = Mount::new(self.runner, source)?;
        let archived = self.archive(mount.mountpoint());
        unwind(archived, mount.unmount(), "mount")
    }

    fn archive(&self, dir: &Path) -> Result<()> {
        let outcome = self
            .archiver
            .create_archive(&self.repository, &self.config.archive_name, dir)?;
        if let Outcome::Warning(text) = outcome {
            warn!("Archiver reported warnings: {}", text.trim());
        }
        Ok(())
    }
}

/// Combines the result of a scope body with the result of releasing the
/// scope's resource. A body failure takes precedence; a release failure
/// that it supersedes is logged.
fn unwind<T>(body: Result<T>, release: Result<()>, resource: &str) -> Result<T> {
    match (body, release) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            error!("Failed to release {resource} after an earlier error: {release_err}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::scripted::ScriptedRunner;
    use crate::tool::ToolOutput;
    use fs_err as fs;
    use std::cell::RefCell;
    use tempfile::{tempdir, NamedTempFile, TempDir};

    /// Archiver that populates new repositories and records archive calls.
    #[derive(Default)]
    struct RecordingArchiver {
        archived: RefCell<Vec<(PathBuf, String, PathBuf)>>,
        fail_with: Option<String>,
    }

    impl Archiver for RecordingArchiver {
        fn init_repository(&self, dir: &Path) -> Result<Outcome> {
            fs::write(dir.join("config"), "")?;
            Ok(Outcome::Success)
        }

        fn create_archive(&self, repository: &Path, name: &str, source: &Path) -> Result<Outcome> {
            self.archived.borrow_mut().push((
                repository.to_path_buf(),
                name.to_owned(),
                source.to_path_buf(),
            ));
            match &self.fail_with {
                Some(stderr) => Err(Error::ExternalTool {
                    command: "borg create".to_owned(),
                    code: Some(2),
                    stderr: stderr.clone(),
                }),
                None => Ok(Outcome::Warning("some files changed".to_owned())),
            }
        }
    }

    struct Fixture {
        root: TempDir,
        source: TempDir,
        device: NamedTempFile,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: tempdir().unwrap(),
                source: tempdir().unwrap(),
                device: NamedTempFile::new().unwrap(),
            }
        }

        fn config(&self, snapshot: SnapshotMode) -> Config {
            Config {
                snapshot,
                ..Config::new(self.source.path(), self.root.path())
            }
        }

        fn script_btrfs(&self, runner: &ScriptedRunner) {
            runner
                .respond("stat", ToolOutput::success("btrfs\n"))
                .respond(
                    "findmnt",
                    ToolOutput::success(format!("{}[/@data]\n", self.device.path().display())),
                )
                .respond("findmnt", ToolOutput::success("/data\n"))
                .respond("lsblk", ToolOutput::success("FSTYPE\nbtrfs\n"));
        }
    }

    #[test]
    fn unwind_prefers_body_error() {
        let body: Result<()> = Err(Error::Validation("body".to_owned()));
        let release = Err(Error::Validation("release".to_owned()));
        match unwind(body, release, "test") {
            Err(Error::Validation(message)) => assert_eq!(message, "body"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            unwind(Ok(()), Err(Error::Validation("release".to_owned())), "test"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn btrfs_run_unmounts_before_deleting_snapshot() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new();
        fixture.script_btrfs(&runner);
        let archiver = RecordingArchiver::default();

        run(&fixture.config(SnapshotMode::Auto), &runner, &archiver).unwrap();

        let archived = archiver.archived.borrow();
        assert_eq!(archived.len(), 1);
        assert_ne!(archived[0].2, fixture.source.path());
        assert!(!archived[0].2.exists());

        let mount = runner.position("mount -o ro,subvol=/@data/bkmgrsnap").unwrap();
        let umount = runner.position("umount").unwrap();
        let delete = runner.position("btrfs subvolume delete /data/bkmgrsnap").unwrap();
        assert!(runner.position("btrfs subvolume snapshot -r").unwrap() < mount);
        assert!(mount < umount);
        assert!(umount < delete);
    }

    #[test]
    fn archiver_failure_still_tears_down_in_order() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new();
        fixture.script_btrfs(&runner);
        let archiver = RecordingArchiver {
            fail_with: Some("repository does not exist".to_owned()),
            ..RecordingArchiver::default()
        };

        let err = run(&fixture.config(SnapshotMode::Auto), &runner, &archiver).unwrap_err();

        assert!(matches!(err, Error::ExternalTool { code: Some(2), .. }));
        assert!(!archiver.archived.borrow()[0].2.exists());
        let umount = runner.position("umount").unwrap();
        let delete = runner.position("btrfs subvolume delete").unwrap();
        assert!(umount < delete);
    }

    #[test]
    fn failed_mount_still_deletes_snapshot() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new();
        fixture.script_btrfs(&runner);
        runner.respond("mount", ToolOutput::failure(32, "bad superblock"));
        let archiver = RecordingArchiver::default();

        let err = run(&fixture.config(SnapshotMode::Auto), &runner, &archiver).unwrap_err();

        assert!(matches!(err, Error::ExternalTool { code: Some(32), .. }));
        assert!(archiver.archived.borrow().is_empty());
        assert!(runner.position("umount").is_none());
        assert!(runner.position("btrfs subvolume delete").is_some());

        let mount = runner.calls().into_iter().find(|c| c.program() == "mount").unwrap();
        assert!(!PathBuf::from(mount.get_args().last().unwrap()).exists());
    }

    #[test]
    fn failed_snapshot_creation_never_mounts() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new();
        fixture.script_btrfs(&runner);
        runner.respond("btrfs", ToolOutput::failure(1, "Read-only file system"));
        let archiver = RecordingArchiver::default();

        let err = run(&fixture.config(SnapshotMode::Auto), &runner, &archiver).unwrap_err();

        assert!(matches!(err, Error::ExternalTool { code: Some(1), .. }));
        assert!(archiver.archived.borrow().is_empty());
        assert!(runner.position("lsblk").is_none());
        assert!(runner.position("mount").is_none());
        assert!(runner.position("btrfs subvolume delete").is_none());
    }

    #[test]
    fn failed_unmount_still_deletes_snapshot() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new();
        fixture.script_btrfs(&runner);
        runner.respond("umount", ToolOutput::failure(32, "target is busy"));
        let archiver = RecordingArchiver::default();

        let err = run(&fixture.config(SnapshotMode::Auto), &runner, &archiver).unwrap_err();

        match err {
            Error::ExternalTool { command, code, .. } => {
                assert!(command.starts_with("umount"));
                assert_eq!(code, Some(32));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!archiver.archived.borrow()[0].2.exists());
        let umount = runner.position("umount").unwrap();
        let delete = runner.position("btrfs subvolume delete").unwrap();
        assert!(umount < delete);
    }

    #[test]
    fn non_btrfs_source_is_archived_directly() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new();
        runner.respond("stat", ToolOutput::success("ext2/ext3\n"));
        let archiver = RecordingArchiver::default();

        run(&fixture.config(SnapshotMode::Auto), &runner, &archiver).unwrap();

        assert_eq!(archiver.archived.borrow()[0].2, fixture.source.path());
        assert!(runner.position("mount").is_none());
        assert!(runner.position("lsblk").is_none());
    }

    #[test]
    fn invalid_archive_name_stops_before_any_tool() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new();
        let archiver = RecordingArchiver::default();
        let config = Config {
            archive_name: "daily.checkpoint".to_owned(),
            ..fixture.config(SnapshotMode::Auto)
        };

        let err = run(&config, &runner, &archiver).unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(runner.calls().is_empty());
        assert!(!repository::lock_file_path(fixture.root.path()).exists());
    }

    #[test]
    fn missing_source_is_not_found() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new();
        let archiver = RecordingArchiver::default();
        let config = Config::new(fixture.source.path().join("missing"), fixture.root.path());

        let err = run(&config, &runner, &archiver).unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn uninitialized_destination_is_refused() {
        let fixture = Fixture::new();
        fs::create_dir(fixture.root.path().join("2024-01-02_03:04:05")).unwrap();
        fs::write(
            repository::lock_file_path(fixture.root.path()),
            "2024-01-02_03:04:05\n",
        )
        .unwrap();
        let runner = ScriptedRunner::new();
        let archiver = RecordingArchiver::default();

        let err = run(&fixture.config(SnapshotMode::Disabled), &runner, &archiver).unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(archiver.archived.borrow().is_empty());
    }
}
