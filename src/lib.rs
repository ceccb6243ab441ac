use thiserror::Error;

pub mod backup;
pub mod bitmap;
pub mod cli;
pub mod config;
pub mod copy;
pub mod datasink;
pub mod delta;
pub mod filter;
pub mod logging;
pub mod page;
pub mod redo;
pub mod restore;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error on {path}: {source}")]
    IoAt {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt data in {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("changed page data missing for LSNs between {start} and {end}")]
    MissingRange { start: u64, end: u64 },
    #[error("inconsistent backup: {0}")]
    Inconsistent(String),
    #[error("invalid metadata in {path}: {reason}")]
    InvalidMetadata { path: String, reason: String },
    #[error("invalid delta file {path}: {reason}")]
    InvalidDelta { path: String, reason: String },
    #[error("invalid target directory: {0}")]
    InvalidTargetDir(String),
    #[error("target directory not empty: {0}")]
    TargetNotEmpty(String),
    #[error("target directory is locked by running backup (pid {0})")]
    TargetBusy(i32),
    #[error("{failed} of {total} copy workers failed, first failure: {first}")]
    WorkerFailed {
        failed: usize,
        total: usize,
        first: String,
    },
    #[error("invalid table filter: {0}")]
    InvalidFilter(String),
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Coarse classification used by the top level to decide how a failure is
/// reported and whether a run may degrade instead of aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Corrupt,
    MissingRange,
    Inconsistent,
    Usage,
}

impl Error {
    pub fn io_at(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Error::IoAt {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn corrupt(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IoAt { .. } | Error::Io(_) => ErrorKind::Io,
            Error::Corrupt { .. } | Error::InvalidMetadata { .. } | Error::InvalidDelta { .. } => {
                ErrorKind::Corrupt
            }
            Error::MissingRange { .. } => ErrorKind::MissingRange,
            Error::Inconsistent(_) | Error::WorkerFailed { .. } => ErrorKind::Inconsistent,
            Error::InvalidTargetDir(_)
            | Error::TargetNotEmpty(_)
            | Error::TargetBusy(_)
            | Error::InvalidFilter(_)
            | Error::Serde(_)
            | Error::Cli(_) => ErrorKind::Usage,
        }
    }
}

/// Classify an error chain; `None` when the root error is not one of ours.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<Error>().map(Error::kind)
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    if let Some(format) = cli_args.log_format {
        logging::init_logging(format)?;
    }
    cli::dispatch(cli_args)
}
