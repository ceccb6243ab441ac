//! Implementation of `hotbackup backup`.

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use crate::{
    backup::{HotBackup, LocalSession},
    config::BackupConfig,
    logging, Result,
};

#[derive(Debug, Clone, Args, Default)]
pub struct BackupArgs {
    /// JSON configuration file; flags given here override its values
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Data directory to back up
    #[arg(long = "datadir")]
    pub datadir: Option<PathBuf>,

    /// Empty (or absent) directory receiving the backup
    #[arg(long = "target-dir")]
    pub target_dir: Option<PathBuf>,

    /// Earlier backup to take an incremental backup against
    #[arg(long = "incremental-basedir", conflicts_with = "incremental_lsn")]
    pub incremental_basedir: Option<PathBuf>,

    /// Copy only pages changed after this LSN
    #[arg(long = "incremental-lsn")]
    pub incremental_lsn: Option<u64>,

    /// Number of copy workers
    #[arg(long = "parallel")]
    pub parallel: Option<usize>,

    /// Cap on batch reads per second (0 disables)
    #[arg(long = "throttle")]
    pub throttle: Option<u64>,

    /// Redo log polling interval in milliseconds
    #[arg(long = "log-copy-interval")]
    pub log_copy_interval_ms: Option<u64>,

    /// Scan whole tablespaces instead of reading changed page bitmaps
    #[arg(long = "no-changed-page-bitmaps")]
    pub no_bitmaps: bool,

    /// Databases to include (comma separated)
    #[arg(long = "databases", value_delimiter = ',')]
    pub databases: Vec<String>,

    /// Databases to leave out (comma separated)
    #[arg(long = "databases-exclude", value_delimiter = ',')]
    pub databases_exclude: Vec<String>,

    /// Regular expression over `db.table` of tables to include
    #[arg(long = "tables")]
    pub tables: Vec<String>,

    /// Regular expression over `db.table` of tables to leave out
    #[arg(long = "tables-exclude")]
    pub tables_exclude: Vec<String>,
}

/// Merge the config file (if any) with the flags and validate the result.
pub fn resolve_config(args: BackupArgs) -> Result<BackupConfig> {
    let mut config = match &args.config {
        Some(path) => BackupConfig::load(path)?,
        None => BackupConfig::default(),
    };

    if let Some(datadir) = args.datadir {
        config.datadir = datadir;
    }
    if let Some(target_dir) = args.target_dir {
        config.target_dir = target_dir;
    }
    if args.incremental_basedir.is_some() {
        config.incremental_basedir = args.incremental_basedir;
        config.incremental_lsn = None;
    }
    if args.incremental_lsn.is_some() {
        config.incremental_lsn = args.incremental_lsn;
        config.incremental_basedir = None;
    }
    if let Some(parallel) = args.parallel {
        config.parallel = parallel;
    }
    if let Some(throttle) = args.throttle {
        config.throttle = throttle;
    }
    if let Some(interval) = args.log_copy_interval_ms {
        config.log_copy_interval_ms = interval;
    }
    if args.no_bitmaps {
        config.use_changed_page_bitmaps = false;
    }
    let filters = &mut config.filters;
    filters.databases.extend(args.databases);
    filters.databases_exclude.extend(args.databases_exclude);
    filters.tables.extend(args.tables);
    filters.tables_exclude.extend(args.tables_exclude);

    config.validate()?;
    Ok(config)
}

pub fn execute(args: BackupArgs) -> Result<()> {
    let config = resolve_config(args)?;
    logging::init_logging(config.log_format)?;

    let mut session = LocalSession::new(&config.datadir);
    let report = HotBackup::new(config, &mut session)?.run()?;
    info!(
        backup_id = %report.backup_id,
        backup_type = %report.metadata.backup_type,
        from_lsn = report.metadata.from_lsn,
        to_lsn = report.metadata.to_lsn,
        files = report.copy.files_done,
        pages = report.copy.pages_written,
        used_bitmaps = report.used_bitmaps,
        partial = report.partial,
        "backup finished"
    );
    Ok(())
}
