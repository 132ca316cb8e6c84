//! The archiving tool that stores backed-up data in a destination
//! repository.
//!
//! Archiving itself (content addressing, deduplication, encryption) is
//! entirely the collaborator's business. This module only defines the
//! interface the backup run needs from it.

use crate::error::{Error, Result};
use std::path::Path;

pub mod borg;

/// Longest archive name the archiver accepts.
pub const MAX_ARCHIVE_NAME_LEN: usize = 255;

/// Non-fatal result of an archiver call. Hard failures are `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The operation completed, but the tool reported problems.
    Warning(String),
}

pub trait Archiver {
    /// Initializes a new repository in `dir`.
    ///
    /// Must only be called on a directory known to be empty and writeable.
    fn init_repository(&self, dir: &Path) -> Result<Outcome>;

    /// Archives `source` into an existing, initialized `repository`
    /// under the archive name `name`.
    fn create_archive(&self, repository: &Path, name: &str, source: &Path) -> Result<Outcome>;
}

/// Rejects archive names the archiver would refuse or misinterpret.
pub fn validate_archive_name(name: &str) -> Result<()> {
    if name.contains("checkpoint") {
        return Err(Error::Validation(format!(
            "archive name cannot contain `checkpoint`: {name}"
        )));
    }
    if name.is_empty() || name.chars().count() > MAX_ARCHIVE_NAME_LEN {
        return Err(Error::Validation(format!(
            "archive name must be between 1 and {MAX_ARCHIVE_NAME_LEN} characters: {name}"
        )));
    }
    Ok(())
}
