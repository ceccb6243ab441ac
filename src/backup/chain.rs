use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

use super::metadata::{BackupMetadata, BackupType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChainIntegrity {
    Valid,
    /// The chain does not start from a full backup.
    Incomplete,
    /// A member's record contradicts its position in the chain.
    Corrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainElement {
    pub dir: PathBuf,
    pub metadata: BackupMetadata,
}

/// A full backup followed by the incrementals to apply to it, in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupChain {
    pub elements: Vec<ChainElement>,
    pub integrity_state: ChainIntegrity,
}

impl BackupChain {
    /// Load and link the records of `full_dir` and `incremental_dirs`.
    /// Every incremental must start where the previous member ended.
    pub fn resolve(full_dir: &Path, incremental_dirs: &[PathBuf]) -> Result<Self> {
        let base = ChainElement {
            dir: full_dir.to_path_buf(),
            metadata: BackupMetadata::load(full_dir)?,
        };
        let mut integrity = if base.metadata.backup_type.is_base() {
            ChainIntegrity::Valid
        } else {
            ChainIntegrity::Incomplete
        };

        let mut elements = vec![base];
        for dir in incremental_dirs {
            let metadata = BackupMetadata::load(dir)?;
            let prev = elements
                .last()
                .map(|e| &e.metadata)
                .ok_or_else(|| Error::Inconsistent("empty backup chain".into()))?;
            if metadata.from_lsn != prev.to_lsn {
                return Err(Error::Inconsistent(format!(
                    "incremental {} starts at LSN {} but the chain ends at LSN {}",
                    dir.display(),
                    metadata.from_lsn,
                    prev.to_lsn
                ))
                .into());
            }
            if metadata.backup_type != BackupType::Incremental {
                integrity = ChainIntegrity::Corrupt;
            }
            elements.push(ChainElement {
                dir: dir.clone(),
                metadata,
            });
        }

        debug!(members = elements.len(), ?integrity, "backup chain resolved");
        Ok(Self {
            elements,
            integrity_state: integrity,
        })
    }

    pub fn base(&self) -> &ChainElement {
        &self.elements[0]
    }

    pub fn incrementals(&self) -> &[ChainElement] {
        &self.elements[1..]
    }

    pub fn to_lsn(&self) -> u64 {
        self.elements.last().map_or(0, |e| e.metadata.to_lsn)
    }

    pub fn ensure_valid(&self) -> Result<()> {
        if self.integrity_state != ChainIntegrity::Valid {
            return Err(Error::Inconsistent(format!(
                "backup chain rooted at {} is {:?}",
                self.base().dir.display(),
                self.integrity_state
            ))
            .into());
        }
        Ok(())
    }
}
