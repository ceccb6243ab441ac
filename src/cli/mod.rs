//! Command line surface; each subcommand lives in its own module.

use clap::{CommandFactory, Parser, Subcommand};

use crate::{logging::LogFormat, Result};

pub mod backup;
pub mod copy_back;
pub mod prepare;

#[derive(Debug, Clone)]
pub enum Command {
    Backup(backup::BackupArgs),
    Prepare(prepare::PrepareArgs),
    CopyBack(copy_back::CopyBackArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
    pub log_format: Option<LogFormat>,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
            log_format: None,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Backup(b) => backup::execute(b),
        Command::Prepare(p) => prepare::execute(p),
        Command::CopyBack(c) => copy_back::execute(c),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(name = "hotbackup", version, about = "Hot and incremental backups of page-oriented tablespaces")]
struct Cli {
    /// Log output format: human or json
    #[arg(long = "log-format", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Take a full or incremental backup of a running data directory.
    Backup(backup::BackupArgs),
    /// Merge incremental backups into a full backup.
    Prepare(prepare::PrepareArgs),
    /// Copy a prepared backup into an empty data directory.
    CopyBack(copy_back::CopyBackArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let command = match cli.command {
        Some(Subcommands::Backup(args)) => Command::Backup(args),
        Some(Subcommands::Prepare(args)) => Command::Prepare(args),
        Some(Subcommands::CopyBack(args)) => Command::CopyBack(args),
        None => Command::None,
    };

    Ok(CliArgs {
        command,
        log_format: cli.log_format,
    })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
