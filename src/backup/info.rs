use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{datasink::Datasink, Error, Result};

pub const INFO_FILE: &str = "hotbackup_info.json";
pub const BINLOG_INFO_FILE: &str = "hotbackup_binlog_info";

/// Summary written once a backup has completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupInfo {
    pub backup_id: Uuid,
    pub tool_version: String,
    pub start_time: u64,
    pub end_time: u64,
    /// Seconds the session lock was held.
    pub lock_time: u64,
    pub from_lsn: u64,
    pub to_lsn: u64,
    pub last_lsn: u64,
    pub incremental: bool,
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binlog_position: Option<String>,
}

impl BackupInfo {
    pub fn write(&self, sink: &dyn Datasink) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        crate::datasink::write_file(sink, Path::new(INFO_FILE), &data)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(INFO_FILE);
        let data = std::fs::read(&path).map_err(|e| Error::io_at(&path, e))?;
        Ok(serde_json::from_slice(&data)?)
    }
}
