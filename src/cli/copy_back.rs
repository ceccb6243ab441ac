//! Implementation of `hotbackup copy-back`.

use std::path::PathBuf;

use clap::Args;

use crate::{logging, restore, Error, Result};

#[derive(Debug, Clone, Args, Default)]
pub struct CopyBackArgs {
    /// Prepared backup to restore from
    #[arg(long = "target-dir")]
    pub target_dir: Option<PathBuf>,

    /// Data directory to restore into
    #[arg(long = "datadir")]
    pub datadir: Option<PathBuf>,

    /// Copy even if the data directory is not empty
    #[arg(long = "force")]
    pub force: bool,
}

pub fn execute(args: CopyBackArgs) -> Result<()> {
    let target_dir = args
        .target_dir
        .ok_or_else(|| Error::Cli("target_dir is required".into()))?;
    let datadir = args
        .datadir
        .ok_or_else(|| Error::Cli("datadir is required".into()))?;
    if !target_dir.is_dir() {
        return Err(Error::InvalidTargetDir(target_dir.display().to_string()).into());
    }
    logging::init_logging(logging::LogFormat::default())?;

    restore::copy_back(&target_dir, &datadir, args.force)?;
    Ok(())
}
