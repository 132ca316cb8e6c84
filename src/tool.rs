//! Invocation of the external programs that do the actual snapshot,
//! mount and archive work.
//!
//! Every call goes through a [`ToolRunner`] with explicit arguments;
//! nothing is ever interpolated into a shell.

use crate::error::{Error, Result};
use std::ffi::{OsStr, OsString};
use std::fmt::{Display, Formatter};
use std::process::Command;
use tracing::debug;

pub mod scripted;

/// A program together with its argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Sets an environment variable for this invocation only.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(OsString, OsString)] {
        &self.envs
    }
}

impl Display for ToolCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Exit status and captured output of a finished program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external programs synchronously, blocking until they exit.
pub trait ToolRunner {
    /// Runs `command` to completion, returning its output whatever the
    /// exit status. Fails only if the program could not be started.
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput>;

    /// Runs `command` and turns any nonzero exit status into
    /// [`Error::ExternalTool`].
    fn run_checked(&self, command: &ToolCommand) -> Result<ToolOutput> {
        debug!("{command}");
        let output = self.run(command)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(Error::ExternalTool {
                command: command.to_string(),
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}

/// Spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    env: Vec<(OsString, OsString)>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an environment variable passed to every spawned program.
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl ToolRunner for SystemRunner {
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        let output = Command::new(command.program())
            .args(command.get_args())
            .envs(self.env.iter().chain(command.get_envs()).map(|(k, v)| (k, v)))
            .output()
            .map_err(|source| Error::Spawn {
                program: command.program().to_owned(),
                source,
            })?;

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
