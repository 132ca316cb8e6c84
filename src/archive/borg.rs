use crate::archive::{Archiver, Outcome};
use crate::error::{Error, Result};
use crate::path;
use crate::tool::{ToolCommand, ToolOutput, ToolRunner};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Seconds between checkpoints written during `borg create`.
pub const DEFAULT_CHECKPOINT_INTERVAL: u32 = 600;

#[derive(Debug, Clone)]
pub struct BorgConfig {
    pub program: String,
    pub checkpoint_interval: u32,
    /// Passed to every borg invocation on top of the runner's environment.
    pub env: Vec<(String, String)>,
}

impl Default for BorgConfig {
    fn default() -> Self {
        Self {
            program: "borg".to_owned(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            env: vec![(
                "BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK".to_owned(),
                "yes".to_owned(),
            )],
        }
    }
}

/// An [`Archiver`] that drives the `borg` command line tool.
pub struct BorgArchiver<'a> {
    runner: &'a dyn ToolRunner,
    config: BorgConfig,
}

impl<'a> BorgArchiver<'a> {
    pub fn new(runner: &'a dyn ToolRunner, config: BorgConfig) -> Self {
        Self { runner, config }
    }

    fn command(&self) -> ToolCommand {
        self.config
            .env
            .iter()
            .fold(ToolCommand::new(self.config.program.clone()), |command, (k, v)| {
                command.env(k, v)
            })
    }

    /// Maps borg's exit status convention: 0 success, 1 warning,
    /// anything else a hard failure.
    fn interpret(&self, command: &ToolCommand) -> Result<Outcome> {
        debug!("{command}");
        let output = self.runner.run(command)?;
        match output.code {
            Some(0) => Ok(Outcome::Success),
            Some(1) => Ok(Outcome::Warning(output.stderr)),
            _ => Err(hard_failure(command, output)),
        }
    }
}

impl Archiver for BorgArchiver<'_> {
    fn init_repository(&self, dir: &Path) -> Result<Outcome> {
        let dir = absolute(dir)?;
        info!("Creating Borg repo: {}", dir.display());
        let command = self
            .command()
            .args(["init", "--encryption", "none"])
            .arg(&dir);
        let outcome = self.interpret(&command)?;
        info!("Initialized unencrypted Borg repo: {}", dir.display());
        Ok(outcome)
    }

    fn create_archive(&self, repository: &Path, name: &str, source: &Path) -> Result<Outcome> {
        let repository = absolute(repository)?;
        info!("Validating the given path: {}", repository.display());
        if !path::exists(&repository) {
            return Err(Error::NotFound(repository));
        }
        if !path::writeable(&repository) {
            return Err(Error::AccessDenied(repository));
        }
        if path::is_empty_dir(&repository)? {
            return Err(Error::Validation(format!(
                "repository directory is empty: {}",
                repository.display()
            )));
        }
        info!("Validating source path: {}", source.display());
        if !path::exists(source) {
            return Err(Error::NotFound(source.to_path_buf()));
        }
        if !path::readable(source) {
            return Err(Error::AccessDenied(source.to_path_buf()));
        }

        let mut location = repository.clone().into_os_string();
        location.push("::");
        location.push(name);

        let command = self
            .command()
            .args(["create", "--one-file-system", "--stats"])
            .arg("--checkpoint-interval")
            .arg(self.config.checkpoint_interval.to_string())
            .arg(location)
            .arg(source);
        info!("Creating archive {name} in {}", repository.display());
        let outcome = self.interpret(&command)?;
        info!("Created archive: {}::{name}", repository.display());
        Ok(outcome)
    }
}

fn hard_failure(command: &ToolCommand, output: ToolOutput) -> Error {
    Error::ExternalTool {
        command: command.to_string(),
        code: output.code,
        stderr: output.stderr,
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::scripted::ScriptedRunner;
    use fs_err as fs;
    use std::ffi::OsString;
    use tempfile::tempdir;

    fn plain_config() -> BorgConfig {
        BorgConfig {
            env: Vec::new(),
            ..BorgConfig::default()
        }
    }

    #[test]
    fn create_passes_repository_location_and_source() {
        let repo = tempdir().unwrap();
        let source = tempdir().unwrap();
        fs::write(repo.path().join("config"), "").unwrap();
        let runner = ScriptedRunner::new();

        let outcome = BorgArchiver::new(&runner, plain_config())
            .create_archive(repo.path(), "{hostname}-{now}", source.path())
            .unwrap();

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(
            runner.command_lines(),
            vec![format!(
                "borg create --one-file-system --stats --checkpoint-interval 600 {}::{{hostname}}-{{now}} {}",
                repo.path().display(),
                source.path().display()
            )]
        );
    }

    #[test]
    fn init_carries_environment_overrides() {
        let repo = tempdir().unwrap();
        let runner = ScriptedRunner::new();

        BorgArchiver::new(&runner, BorgConfig::default())
            .init_repository(repo.path())
            .unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls[0].to_string(),
            format!("borg init --encryption none {}", repo.path().display())
        );
        assert_eq!(
            calls[0].get_envs(),
            &[(
                OsString::from("BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK"),
                OsString::from("yes")
            )]
        );
    }

    #[test]
    fn exit_status_one_is_a_warning() {
        let repo = tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.respond("borg", ToolOutput::failure(1, "file changed while read"));

        let outcome = BorgArchiver::new(&runner, plain_config())
            .init_repository(repo.path())
            .unwrap();
        assert_eq!(outcome, Outcome::Warning("file changed while read".to_owned()));
    }

    #[test]
    fn exit_status_two_is_a_hard_failure() {
        let repo = tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.respond("borg", ToolOutput::failure(2, "repository locked"));

        let err = BorgArchiver::new(&runner, plain_config())
            .init_repository(repo.path())
            .unwrap_err();
        assert!(matches!(err, Error::ExternalTool { code: Some(2), .. }));
    }

    #[test]
    fn create_refuses_uninitialized_repository() {
        let repo = tempdir().unwrap();
        let source = tempdir().unwrap();
        let runner = ScriptedRunner::new();

        let err = BorgArchiver::new(&runner, plain_config())
            .create_archive(repo.path(), "name", source.path())
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(runner.calls().is_empty());
    }
}
