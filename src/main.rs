use anyhow::Context;
use borgsnap::archive::borg::{BorgArchiver, BorgConfig};
use borgsnap::backup;
use borgsnap::snapshot::{SnapshotMode, SnapshotSize};
use borgsnap::tool::SystemRunner;
use borgsnap::DEFAULT_ARCHIVE_NAME;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, Level};

/// Borg Backup Manager
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Source directory containing data to back up, or the logical
    /// volume with --lvm.
    #[arg(value_name = "SRC")]
    source: PathBuf,
    /// Root directory the repositories reside in.
    #[arg(value_name = "TARGET")]
    target: PathBuf,

    /// Use LVM snapshots to back up a filesystem on an LVM volume.
    #[arg(short, long)]
    lvm: bool,
    /// Size for a COW snapshot in GiB. Valid on both classic and thin LVM
    /// volumes.
    #[arg(
        long,
        value_name = "COW_SIZE",
        requires = "lvm",
        conflicts_with = "no_cow",
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    cow_size: Option<u32>,
    /// Use LVM thin snapshots instead of COW snapshots. Valid only on thin
    /// LVM volumes.
    #[arg(short, long, requires = "lvm")]
    no_cow: bool,
    /// Back up the source as it is, without trying a btrfs snapshot.
    #[arg(long, conflicts_with = "lvm")]
    no_snapshot: bool,

    /// Create a new repository and update the lock file.
    #[arg(short, long)]
    create_repo: bool,
    #[arg(long, default_value = DEFAULT_ARCHIVE_NAME)]
    archive_name: String,
    /// Borg executable.
    #[arg(long, default_value = "borg")]
    borg: String,
    /// Extra environment variable for every spawned tool, as KEY=VALUE.
    #[arg(long = "tool-env", value_name = "KEY=VALUE", value_parser = parse_env)]
    tool_env: Vec<(String, String)>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn log_level(&self) -> Level {
        if self.debug {
            Level::DEBUG
        } else if self.verbose {
            Level::INFO
        } else {
            Level::WARN
        }
    }

    fn snapshot_mode(&self) -> SnapshotMode {
        if self.lvm {
            let size = if self.no_cow {
                SnapshotSize::Thin
            } else {
                SnapshotSize::from_gib(
                    self.cow_size
                        .unwrap_or(borgsnap::snapshot::lvm::DEFAULT_COW_SIZE_GIB),
                )
            };
            SnapshotMode::Lvm(size)
        } else if self.no_snapshot {
            SnapshotMode::Disabled
        } else {
            SnapshotMode::Auto
        }
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

pub fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level())
        .with_writer(std::io::stderr)
        .init();

    match do_backup(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            error!("Backup failed. Exiting on error...");
            ExitCode::FAILURE
        }
    }
}

fn do_backup(cli: &Cli) -> anyhow::Result<()> {
    let runner = cli
        .tool_env
        .iter()
        .fold(SystemRunner::new(), |runner, (k, v)| runner.with_env(k, v));
    let archiver = BorgArchiver::new(
        &runner,
        BorgConfig {
            program: cli.borg.clone(),
            ..BorgConfig::default()
        },
    );

    let config = backup::Config {
        snapshot: cli.snapshot_mode(),
        create_repository: cli.create_repo,
        archive_name: cli.archive_name.clone(),
        ..backup::Config::new(&cli.source, &cli.target)
    };

    backup::run(&config, &runner, &archiver).with_context(|| {
        format!(
            "backup of {} into {} failed",
            cli.source.display(),
            cli.target.display()
        )
    })
}
