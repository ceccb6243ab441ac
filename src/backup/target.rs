//! Backup target directory and the lock marker guarding it.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Error, Result};

pub const LOCK_FILE: &str = ".hotbackup-lock";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockMarker {
    pub backup_id: Uuid,
    pub pid: i32,
    pub started_at: u64,
}

impl LockMarker {
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let data = fs::read(&path).map_err(|e| Error::io_at(&path, e))?;
        let marker: LockMarker = serde_json::from_slice(&data)?;
        Ok(marker)
    }

    pub fn is_owner_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

#[derive(Debug, Clone)]
pub struct TargetDir {
    path: PathBuf,
}

impl TargetDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        self.path.join(LOCK_FILE)
    }

    /// The target must be absent or an empty directory. A leftover lock
    /// whose owner is still running reports `TargetBusy`; a stale one is
    /// ignored and overwritten by `acquire`.
    pub fn validate_empty(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        if !self.path.is_dir() {
            return Err(Error::InvalidTargetDir(self.path.display().to_string()).into());
        }
        if self.lock_path().exists() {
            match LockMarker::read(&self.path) {
                Ok(marker) if marker.is_owner_alive() => {
                    return Err(Error::TargetBusy(marker.pid).into());
                }
                Ok(marker) => {
                    warn!(pid = marker.pid, backup_id = %marker.backup_id, "stale backup lock in target")
                }
                Err(err) => warn!(error = %err, "unreadable backup lock in target"),
            }
        }
        let entries = fs::read_dir(&self.path).map_err(|e| Error::io_at(&self.path, e))?;
        let mut occupied = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != LOCK_FILE);
        if occupied.next().is_some() {
            return Err(Error::TargetNotEmpty(self.path.display().to_string()).into());
        }
        Ok(())
    }

    /// Create the directory and claim it for `backup_id`.
    pub fn acquire(&self, backup_id: Uuid) -> Result<LockMarker> {
        self.validate_empty()?;
        fs::create_dir_all(&self.path).map_err(|e| Error::io_at(&self.path, e))?;
        let marker = LockMarker {
            backup_id,
            pid: std::process::id() as i32,
            started_at: now_secs(),
        };
        let data = serde_json::to_vec_pretty(&marker)?;
        let path = self.lock_path();
        fs::write(&path, data).map_err(|e| Error::io_at(&path, e))?;
        debug!(target_dir = %self.path.display(), %backup_id, "target locked");
        Ok(marker)
    }

    pub fn release(&self) -> Result<()> {
        let path = self.lock_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_at(&path, e).into()),
        }
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Linux-only: rely on /proc/<pid> presence to detect liveness
    PathBuf::from("/proc").join(pid.to_string()).exists()
}
