//! Tracks which destination under a backup root is the current one.
//!
//! # Layout
//! ```text
//! <root>/lock.txt              name of the current destination, one line
//! <root>/<YYYY-MM-DD_HH:MM:SS>/ one initialized repository per creation
//! ```
//!
//! The lock file always names a destination that exists and has been
//! initialized: the directory is created and initialized first, and the
//! lock file is only replaced afterwards. Replacement goes through a
//! temporary file that is synced and then renamed into place, so a
//! crash leaves either the old or the new pointer, never a torn one.
//!
//! While a run is in progress the lock file stays open for reading and
//! writing. This is advisory only. No OS-level lock is taken, so runs
//! against the same root must be serialized by the caller.

use crate::archive::{Archiver, Outcome};
use crate::error::{Error, Result};
use crate::path;
use chrono::Local;
use fs_err as fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

pub const LOCK_FILE_NAME: &str = "lock.txt";
const TEMP_LOCK_FILE_NAME: &str = "lock.txt.tmp";

/// `strftime` format of destination directory names.
pub const DESTINATION_NAME_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

pub fn lock_file_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE_NAME)
}

/// Creates and initializes a new destination named after the current
/// local time, then points the lock file at it.
pub fn create_destination(root: &Path, initializer: &dyn Archiver) -> Result<String> {
    let name = Local::now().format(DESTINATION_NAME_FORMAT).to_string();
    create_destination_named(root, &name, initializer)?;
    Ok(name)
}

pub(crate) fn create_destination_named(
    root: &Path,
    name: &str,
    initializer: &dyn Archiver,
) -> Result<()> {
    if !path::exists(root) {
        return Err(Error::NotFound(root.to_path_buf()));
    }
    let dir = root.join(name);
    if path::exists(&dir) {
        return Err(Error::NameCollision(dir));
    }

    info!("Creating new repo directory: {name}");
    fs::create_dir(&dir)?;

    if !path::writeable(&dir) {
        return Err(Error::AccessDenied(dir));
    }
    if !path::is_empty_dir(&dir)? {
        return Err(Error::Validation(format!(
            "directory is not empty: {}, refusing to initialize it",
            dir.display()
        )));
    }
    if let Outcome::Warning(text) = initializer.init_repository(&dir)? {
        warn!("Repository initialization reported: {}", text.trim());
    }

    write_lock_file(root, name)?;
    info!("Lock file updated");
    Ok(())
}

fn write_lock_file(root: &Path, name: &str) -> Result<()> {
    let temp_path = root.join(TEMP_LOCK_FILE_NAME);
    let mut temp = fs::File::create(&temp_path)?;
    writeln!(temp, "{name}")?;
    temp.sync_all()?;
    drop(temp);
    fs::rename(temp_path, lock_file_path(root))?;
    Ok(())
}

/// The open lock file of a backup root and the destination it names.
///
/// The file is held open for as long as this value lives.
#[derive(Debug)]
pub struct RepositoryLock {
    _file: fs::File,
    root: PathBuf,
    destination: String,
}

impl RepositoryLock {
    /// Opens the existing lock file of `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let lock_path = lock_file_path(root);
        if !path::exists(&lock_path) {
            return Err(Error::NotFound(lock_path));
        }
        if !path::readable(&lock_path) || !path::file_writeable(&lock_path) {
            return Err(Error::AccessDenied(lock_path));
        }

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&lock_path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let destination = parse_destination(&lock_path, &contents)?;

        Ok(Self {
            _file: file,
            root: root.to_path_buf(),
            destination,
        })
    }

    /// Opens the lock file, creating a first destination if the root has
    /// none yet.
    pub fn resolve(root: &Path, initializer: &dyn Archiver) -> Result<Self> {
        match Self::open(root) {
            Err(Error::NotFound(_)) => {
                create_destination(root, initializer)?;
                Self::open(root)
            }
            other => other,
        }
    }

    pub fn destination_name(&self) -> &str {
        &self.destination
    }

    pub fn destination_path(&self) -> PathBuf {
        self.root.join(&self.destination)
    }
}

/// A destination name must be exactly one normal path component, so the
/// lock file can never point outside the backup root.
fn parse_destination(lock_path: &Path, contents: &str) -> Result<String> {
    let name = contents.trim();
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name.to_owned()),
        _ => Err(Error::Validation(format!(
            "lock file {} does not name a destination: {name:?}",
            lock_path.display()
        ))),
    }
}
