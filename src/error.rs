use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("path does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("user lacks required permissions: {}", .0.display())]
    AccessDenied(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("{0}")]
    Validation(String),

    #[error("destination already exists: {}", .0.display())]
    NameCollision(PathBuf),

    #[error("`{command}` failed with {}: {}", display_code(*.code), .stderr.trim())]
    ExternalTool {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to start `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error signals that an operation cannot be carried out
    /// on this host, as opposed to an unexpected I/O failure.
    pub fn is_infeasible(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::ExternalTool { .. } | Error::Spawn { .. }
        )
    }
}

fn display_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "no exit status".to_owned(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
