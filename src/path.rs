//! Permission and existence predicates on filesystem paths.
//!
//! The boolean predicates never fail: a path that is missing or
//! otherwise unreachable simply answers `false`.

use crate::error::{Error, Result};
use fs_err as fs;
use nix::unistd::{access, AccessFlags};
use std::io;
use std::path::Path;

pub fn exists(path: &Path) -> bool {
    check(path, AccessFlags::F_OK)
}

pub fn readable(path: &Path) -> bool {
    check(path, AccessFlags::R_OK)
}

/// Read, write and traverse access, as needed to populate a directory.
pub fn writeable(path: &Path) -> bool {
    check(path, AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK)
}

/// Write access alone, for regular files.
pub fn file_writeable(path: &Path) -> bool {
    check(path, AccessFlags::W_OK)
}

/// Returns whether `path` is a directory without any entries.
///
/// Unlike the other predicates this one fails if the path is missing,
/// unreadable or not a directory, so callers that need to tell "missing"
/// apart from "non-empty" should check [`exists`] first.
pub fn is_empty_dir(path: &Path) -> Result<bool> {
    let metadata = fs::metadata(path).map_err(|e| classify(path, e))?;
    if !metadata.is_dir() {
        return Err(Error::NotADirectory(path.to_path_buf()));
    }

    let mut entries = fs::read_dir(path).map_err(|e| classify(path, e))?;
    Ok(entries.next().is_none())
}

fn check(path: &Path, mode: AccessFlags) -> bool {
    access(path, mode).is_ok()
}

fn classify(path: &Path, error: io::Error) -> Error {
    match error.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => Error::AccessDenied(path.to_path_buf()),
        _ => Error::Io(error),
    }
}
