//! The `hotbackup_checkpoints` record every backup directory carries.
//!
//! The record is plain `key = value` text so it can be read and edited by
//! hand:
//!
//! ```text
//! backup_type = full-backuped
//! from_lsn = 0
//! to_lsn = 5000
//! last_lsn = 5120
//! recover_binlog_info = 0
//! ```

use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

pub const METADATA_FILE: &str = "hotbackup_checkpoints";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Incremental,
    /// A full backup that incrementals have been merged into.
    LogApplied,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full-backuped",
            BackupType::Incremental => "incremental",
            BackupType::LogApplied => "log-applied",
        }
    }

    /// Whether incrementals may be applied on top of a backup of this type.
    pub fn is_base(&self) -> bool {
        matches!(self, BackupType::Full | BackupType::LogApplied)
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full-backuped" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "log-applied" | "full-prepared" => Ok(BackupType::LogApplied),
            other => Err(format!("unknown backup_type {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupMetadata {
    pub backup_type: BackupType,
    pub from_lsn: u64,
    pub to_lsn: u64,
    /// End of the copied redo log.
    pub last_lsn: u64,
    pub recover_binlog_info: bool,
}

impl BackupMetadata {
    pub fn full(to_lsn: u64, last_lsn: u64) -> Self {
        Self {
            backup_type: BackupType::Full,
            from_lsn: 0,
            to_lsn,
            last_lsn,
            recover_binlog_info: false,
        }
    }

    pub fn incremental(from_lsn: u64, to_lsn: u64, last_lsn: u64) -> Self {
        Self {
            backup_type: BackupType::Incremental,
            from_lsn,
            to_lsn,
            last_lsn,
            recover_binlog_info: false,
        }
    }

    pub fn to_text(&self) -> String {
        format!(
            "backup_type = {}\nfrom_lsn = {}\nto_lsn = {}\nlast_lsn = {}\nrecover_binlog_info = {}\n",
            self.backup_type,
            self.from_lsn,
            self.to_lsn,
            self.last_lsn,
            u8::from(self.recover_binlog_info)
        )
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidMetadata {
            path: path.display().to_string(),
            reason,
        };

        let mut backup_type = None;
        let mut from_lsn = None;
        let mut to_lsn = None;
        let mut last_lsn = None;
        let mut recover_binlog_info = false;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| invalid(format!("malformed line {line:?}")))?;
            let (key, value) = (key.trim(), value.trim());
            let lsn = || {
                value
                    .parse::<u64>()
                    .map_err(|_| invalid(format!("{key} is not a number: {value:?}")))
            };
            match key {
                "backup_type" => backup_type = Some(value.parse::<BackupType>().map_err(invalid)?),
                "from_lsn" => from_lsn = Some(lsn()?),
                "to_lsn" => to_lsn = Some(lsn()?),
                "last_lsn" => last_lsn = Some(lsn()?),
                "recover_binlog_info" => recover_binlog_info = lsn()? != 0,
                _ => {}
            }
        }

        let missing = |key: &str| invalid(format!("missing {key}"));
        let meta = Self {
            backup_type: backup_type.ok_or_else(|| missing("backup_type"))?,
            from_lsn: from_lsn.ok_or_else(|| missing("from_lsn"))?,
            to_lsn: to_lsn.ok_or_else(|| missing("to_lsn"))?,
            last_lsn: last_lsn.ok_or_else(|| missing("last_lsn"))?,
            recover_binlog_info,
        };
        if meta.from_lsn > meta.to_lsn {
            return Err(invalid(format!(
                "from_lsn {} is past to_lsn {}",
                meta.from_lsn, meta.to_lsn
            ))
            .into());
        }
        Ok(meta)
    }

    /// Read the record from a backup directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io_at(&path, e))?;
        let meta = Self::parse(&text, &path)?;
        debug!(path = %path.display(), backup_type = %meta.backup_type, to_lsn = meta.to_lsn, "loaded backup metadata");
        Ok(meta)
    }

    /// Rewrite the record of a backup directory in place.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let path = dir.join(METADATA_FILE);
        let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
        std::fs::write(&tmp, self.to_text()).map_err(|e| Error::io_at(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::io_at(&path, e))?;
        Ok(())
    }
}
