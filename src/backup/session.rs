//! Connection to the running server for the few moments a backup needs it.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{
    redo::{RedoLogFile, REDO_LOG_FILE},
    Error, Result,
};

/// What a backup asks of the server: a consistency lock around the end of
/// the copy, the current checkpoint LSN and, optionally, the replication
/// position at the moment of the lock.
pub trait BackupSession: Send {
    fn lock(&mut self) -> Result<()>;

    fn checkpoint_lsn(&self) -> Result<u64>;

    fn binlog_position(&self) -> Option<String> {
        None
    }

    fn unlock(&mut self) -> Result<()>;
}

/// Session for a data directory with no server attached, or one that is
/// quiesced externally. The checkpoint comes from the redo log header.
#[derive(Debug)]
pub struct LocalSession {
    datadir: PathBuf,
    locked: bool,
}

impl LocalSession {
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        Self {
            datadir: datadir.into(),
            locked: false,
        }
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl BackupSession for LocalSession {
    fn lock(&mut self) -> Result<()> {
        if self.locked {
            return Err(Error::Inconsistent("session is already locked".into()).into());
        }
        self.locked = true;
        info!(datadir = %self.datadir.display(), "backup lock acquired");
        Ok(())
    }

    fn checkpoint_lsn(&self) -> Result<u64> {
        let log = RedoLogFile::open(&self.datadir.join(REDO_LOG_FILE))?;
        let cp = log.read_checkpoint()?;
        debug!(checkpoint_lsn = cp.lsn, "checkpoint read");
        Ok(cp.lsn)
    }

    fn unlock(&mut self) -> Result<()> {
        if self.locked {
            self.locked = false;
            info!("backup lock released");
        }
        Ok(())
    }
}
