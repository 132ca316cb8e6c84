pub mod archive;
pub mod backup;
pub mod error;
pub mod mount;
pub mod path;
pub mod repository;
pub mod snapshot;
pub mod tool;

pub use error::{Error, Result};

/// Default archive name. Placeholders are expanded by borg when the
/// archive is created.
pub const DEFAULT_ARCHIVE_NAME: &str = "{hostname}-{now}";
