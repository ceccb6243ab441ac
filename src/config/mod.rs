//! Backup configuration, loadable from a JSON file and overridden from the
//! command line.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{logging::LogFormat, Error, Result};

pub const DEFAULT_LOG_COPY_INTERVAL_MS: u64 = 1000;

/// Include/exclude lists for partial backups. Database entries are exact
/// names; table entries are regular expressions matched against `db.table`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TableFilterConfig {
    pub databases: Vec<String>,
    pub databases_exclude: Vec<String>,
    pub tables: Vec<String>,
    pub tables_exclude: Vec<String>,
}

impl TableFilterConfig {
    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
            && self.databases_exclude.is_empty()
            && self.tables.is_empty()
            && self.tables_exclude.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupConfig {
    pub datadir: PathBuf,
    pub target_dir: PathBuf,
    /// Earlier backup whose `to_lsn` becomes the incremental base.
    pub incremental_basedir: Option<PathBuf>,
    pub incremental_lsn: Option<u64>,
    pub parallel: usize,
    /// Batch reads per second across all workers; 0 disables throttling.
    pub throttle: u64,
    pub log_copy_interval_ms: u64,
    pub use_changed_page_bitmaps: bool,
    pub filters: TableFilterConfig,
    pub log_format: LogFormat,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            datadir: PathBuf::new(),
            target_dir: PathBuf::new(),
            incremental_basedir: None,
            incremental_lsn: None,
            parallel: 1,
            throttle: 0,
            log_copy_interval_ms: DEFAULT_LOG_COPY_INTERVAL_MS,
            use_changed_page_bitmaps: true,
            filters: TableFilterConfig::default(),
            log_format: LogFormat::Human,
        }
    }
}

impl BackupConfig {
    pub fn new(datadir: impl Into<PathBuf>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            datadir: datadir.into(),
            target_dir: target_dir.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| Error::io_at(path, e))?;
        let config: BackupConfig = serde_json::from_slice(&data)?;
        debug!(path = %path.display(), "loaded backup config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.datadir.as_os_str().is_empty() {
            return Err(Error::Cli("datadir is required".into()).into());
        }
        if self.target_dir.as_os_str().is_empty() {
            return Err(Error::Cli("target_dir is required".into()).into());
        }
        if self.incremental_basedir.is_some() && self.incremental_lsn.is_some() {
            return Err(Error::Cli(
                "incremental_basedir and incremental_lsn are mutually exclusive".into(),
            )
            .into());
        }
        if self.parallel == 0 {
            return Err(Error::Cli("parallel must be at least 1".into()).into());
        }
        if self.log_copy_interval_ms == 0 {
            return Err(Error::Cli("log_copy_interval_ms must be positive".into()).into());
        }
        Ok(())
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental_basedir.is_some() || self.incremental_lsn.is_some()
    }

    pub fn log_copy_interval(&self) -> Duration {
        Duration::from_millis(self.log_copy_interval_ms)
    }
}
