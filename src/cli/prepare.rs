//! Implementation of `hotbackup prepare`.

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use crate::{logging, restore, Error, Result};

#[derive(Debug, Clone, Args, Default)]
pub struct PrepareArgs {
    /// Full backup to prepare in place
    #[arg(long = "target-dir")]
    pub target_dir: Option<PathBuf>,

    /// Incremental backup to merge; repeat in the order they were taken
    #[arg(long = "incremental-dir")]
    pub incremental_dirs: Vec<PathBuf>,
}

pub fn execute(args: PrepareArgs) -> Result<()> {
    let target_dir = args
        .target_dir
        .ok_or_else(|| Error::Cli("target_dir is required".into()))?;
    if !target_dir.is_dir() {
        return Err(Error::InvalidTargetDir(target_dir.display().to_string()).into());
    }
    logging::init_logging(logging::LogFormat::default())?;

    let report = restore::prepare(&target_dir, &args.incremental_dirs)?;
    info!(
        incrementals = report.incrementals,
        pages = report.deltas.pages,
        removed_tablespaces = report.removed_tablespaces,
        to_lsn = report.to_lsn,
        "prepare finished"
    );
    Ok(())
}
