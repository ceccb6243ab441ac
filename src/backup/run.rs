//! A whole backup run: redo copy, data file copy and the lifecycle hooks
//! that close the backup consistently.

use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::{
    info::{BackupInfo, BINLOG_INFO_FILE},
    metadata::{BackupMetadata, BackupType, METADATA_FILE},
    session::BackupSession,
    target::{now_secs, TargetDir, LOCK_FILE},
};
use crate::{
    bitmap::{files::is_bitmap_file, ChangedPageIndex},
    config::BackupConfig,
    copy::{
        copy_plain_file, is_tablespace, BitmapFiltered, CopyOrchestrator, DatadirEntry,
        DatadirIterator, EntryKind, IncrementalDelta, PassThrough, Throttle, Ticker, WriteThrough,
    },
    datasink::{self, Datasink, LocalDatasink},
    delta::{delta_path, meta_path, strip_delta_suffix},
    error_kind,
    filter::TableFilter,
    logging::CopyProgressSnapshot,
    redo::{RedoLogFile, RedoTailer, TailerHandle, BACKUP_LOG_FILE, REDO_LOG_FILE},
    Error, ErrorKind, Result,
};

const THROTTLE_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of a completed backup.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub backup_id: Uuid,
    pub metadata: BackupMetadata,
    pub copy: CopyProgressSnapshot,
    pub used_bitmaps: bool,
    pub partial: bool,
}

pub struct HotBackup<'s> {
    config: BackupConfig,
    session: &'s mut dyn BackupSession,
    filter: TableFilter,
    target: TargetDir,
    sink: LocalDatasink,
    backup_id: Uuid,
    started_at: u64,
    lock_acquired: Option<Instant>,
    lock_time: Duration,
    binlog_position: Option<String>,
}

impl std::fmt::Debug for HotBackup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotBackup")
            .field("backup_id", &self.backup_id)
            .field("datadir", &self.config.datadir)
            .field("target_dir", &self.config.target_dir)
            .finish()
    }
}

impl<'s> HotBackup<'s> {
    /// Validate `config` and claim the target directory.
    pub fn new(config: BackupConfig, session: &'s mut dyn BackupSession) -> Result<Self> {
        config.validate()?;
        if !config.datadir.is_dir() {
            return Err(Error::Cli(format!(
                "datadir {} is not a directory",
                config.datadir.display()
            ))
            .into());
        }
        let filter = TableFilter::from_config(&config.filters)?;
        let target = TargetDir::new(&config.target_dir);
        let backup_id = Uuid::new_v4();
        target.acquire(backup_id)?;
        let sink = LocalDatasink::new(&config.target_dir);
        Ok(Self {
            config,
            session,
            filter,
            target,
            sink,
            backup_id,
            started_at: now_secs(),
            lock_acquired: None,
            lock_time: Duration::ZERO,
            binlog_position: None,
        })
    }

    pub fn backup_id(&self) -> Uuid {
        self.backup_id
    }

    #[instrument(skip_all, fields(backup_id = %self.backup_id, datadir = %self.config.datadir.display()))]
    pub fn run(mut self) -> Result<BackupReport> {
        let checkpoint_lsn = self.session.checkpoint_lsn()?;
        let incremental_lsn = self.resolve_incremental_lsn(checkpoint_lsn)?;
        info!(checkpoint_lsn, incremental_lsn, "backup started");

        let tailer = self.start_redo_copy(checkpoint_lsn)?;

        let (copy, used_bitmaps) = match self.copy_data_files(incremental_lsn, checkpoint_lsn) {
            Ok(res) => res,
            Err(err) => {
                abandon_tailer(tailer);
                return Err(err);
            }
        };

        if let Err(err) = self.backup_start() {
            abandon_tailer(tailer);
            if let Err(unlock_err) = self.session.unlock() {
                warn!(error = %unlock_err, "failed to release backup lock");
            }
            return Err(err);
        }
        let metadata = self.backup_release(tailer, incremental_lsn)?;
        self.backup_finish(&metadata)?;

        Ok(BackupReport {
            backup_id: self.backup_id,
            metadata,
            copy,
            used_bitmaps,
            partial: self.filter.is_active(),
        })
    }

    fn resolve_incremental_lsn(&self, checkpoint_lsn: u64) -> Result<Option<u64>> {
        let lsn = match (&self.config.incremental_basedir, self.config.incremental_lsn) {
            (Some(basedir), _) => Some(BackupMetadata::load(basedir)?.to_lsn),
            (None, Some(lsn)) => Some(lsn),
            (None, None) => None,
        };
        if let Some(lsn) = lsn {
            if lsn > checkpoint_lsn {
                return Err(Error::Inconsistent(format!(
                    "incremental LSN {lsn} is past the current checkpoint LSN {checkpoint_lsn}"
                ))
                .into());
            }
        }
        Ok(lsn)
    }

    fn start_redo_copy(&self, checkpoint_lsn: u64) -> Result<TailerHandle> {
        let log = RedoLogFile::open(&self.config.datadir.join(REDO_LOG_FILE))?;
        let out = self.sink.open(Path::new(BACKUP_LOG_FILE), None)?;
        let mut tailer = RedoTailer::new(log, out, checkpoint_lsn)?;
        tailer.initial_copy()?;
        tailer.spawn(self.config.log_copy_interval())
    }

    /// Changed page index for `[from_lsn, to_lsn)`, or `None` when the
    /// bitmaps do not cover it and every page has to be read.
    fn changed_page_index(&self, from_lsn: u64, to_lsn: u64) -> Result<Option<ChangedPageIndex>> {
        if !self.config.use_changed_page_bitmaps {
            return Ok(None);
        }
        match ChangedPageIndex::build(&self.config.datadir, from_lsn, to_lsn) {
            Ok(index) => Ok(Some(index)),
            Err(err) => match error_kind(&err) {
                Some(ErrorKind::MissingRange | ErrorKind::Corrupt) => {
                    warn!(error = %err, "changed page bitmaps unusable, scanning full tablespaces");
                    Ok(None)
                }
                _ => Err(err),
            },
        }
    }

    fn copy_data_files(
        &self,
        incremental_lsn: Option<u64>,
        checkpoint_lsn: u64,
    ) -> Result<(CopyProgressSnapshot, bool)> {
        let index = match incremental_lsn {
            Some(lsn) => self.changed_page_index(lsn, checkpoint_lsn)?,
            None => None,
        };

        let throttle = Arc::new(Throttle::new(self.config.throttle));
        let ticker = if self.config.throttle > 0 {
            Some(Ticker::start(Arc::clone(&throttle), THROTTLE_INTERVAL)?)
        } else {
            None
        };
        let mut orchestrator = CopyOrchestrator::new(&self.sink, self.config.parallel);
        if ticker.is_some() {
            orchestrator = orchestrator.with_throttle(&throttle);
        }

        let filter = &self.filter;
        let select = move |entry: &DatadirEntry| selects_data_file(filter, entry);
        let datadir = &self.config.datadir;
        let res = match (&index, incremental_lsn) {
            (Some(index), Some(lsn)) => orchestrator.run(
                datadir,
                &select,
                &BitmapFiltered::new(index),
                &IncrementalDelta::new(lsn),
            ),
            (_, Some(lsn)) => {
                orchestrator.run(datadir, &select, &PassThrough, &IncrementalDelta::new(lsn))
            }
            (_, None) => orchestrator.run(datadir, &select, &PassThrough, &WriteThrough),
        };

        if let Some(ticker) = ticker {
            ticker.stop();
        }
        Ok((res?, index.is_some()))
    }

    /// Take the session lock and copy every file the tablespace pass left
    /// behind.
    #[instrument(skip_all)]
    pub fn backup_start(&mut self) -> Result<()> {
        self.session.lock()?;
        self.lock_acquired = Some(Instant::now());
        self.drop_vanished_tablespaces()?;

        let filter = &self.filter;
        let select = move |entry: &DatadirEntry| selects_plain_file(filter, entry);
        let iter = DatadirIterator::new(&self.config.datadir, &select);
        let mut files = 0u64;
        let mut bytes = 0u64;
        while let Some(entry) = iter.next_entry()? {
            bytes += copy_plain_file(&entry.path, &entry.rel_path, &self.sink)?;
            files += 1;
        }
        info!(files, bytes, "non-tablespace files copied");

        self.binlog_position = self.session.binlog_position();
        if let Some(pos) = &self.binlog_position {
            datasink::write_file(&self.sink, Path::new(BINLOG_INFO_FILE), format!("{pos}\n").as_bytes())?;
        }
        Ok(())
    }

    /// Remove copies of tablespaces that were dropped from the data
    /// directory after the tablespace pass copied them.
    fn drop_vanished_tablespaces(&self) -> Result<usize> {
        let root = self.sink.root();
        let mut copied = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            match strip_delta_suffix(rel) {
                Some(base) if is_tablespace(&base) => copied.push((base, true)),
                None if is_tablespace(rel) => copied.push((rel.to_path_buf(), false)),
                _ => {}
            }
        }

        let mut dropped = 0;
        for (base, is_delta) in copied {
            if self.config.datadir.join(&base).exists() {
                continue;
            }
            if is_delta {
                self.sink.remove(&delta_path(&base))?;
                self.sink.remove(&meta_path(&base))?;
            } else {
                self.sink.remove(&base)?;
            }
            debug!(path = %base.display(), "tablespace dropped during backup");
            dropped += 1;
        }
        if dropped > 0 {
            info!(dropped, "removed tablespaces dropped during backup");
        }
        Ok(dropped)
    }

    /// Finish the redo copy at the checkpoint seen under the lock, record
    /// the metadata and release the lock.
    #[instrument(skip_all)]
    pub fn backup_release(
        &mut self,
        tailer: TailerHandle,
        incremental_lsn: Option<u64>,
    ) -> Result<BackupMetadata> {
        let res = self.close_under_lock(tailer, incremental_lsn);
        let unlocked = self.session.unlock();
        if let Some(at) = self.lock_acquired.take() {
            self.lock_time = at.elapsed();
        }
        let metadata = res?;
        unlocked?;
        Ok(metadata)
    }

    fn close_under_lock(
        &mut self,
        tailer: TailerHandle,
        incremental_lsn: Option<u64>,
    ) -> Result<BackupMetadata> {
        let to_lsn = match self.session.checkpoint_lsn() {
            Ok(lsn) => lsn,
            Err(err) => {
                abandon_tailer(tailer);
                return Err(err);
            }
        };
        let last_lsn = tailer.stop()?.finish(to_lsn)?;

        let mut metadata = match incremental_lsn {
            Some(from_lsn) => BackupMetadata::incremental(from_lsn, to_lsn, last_lsn),
            None => BackupMetadata::full(to_lsn, last_lsn),
        };
        metadata.recover_binlog_info = self.binlog_position.is_some();
        datasink::write_file(&self.sink, Path::new(METADATA_FILE), metadata.to_text().as_bytes())?;
        info!(
            from_lsn = metadata.from_lsn,
            to_lsn, last_lsn, "backup metadata written"
        );
        Ok(metadata)
    }

    /// Write the backup report and drop the target lock.
    #[instrument(skip_all)]
    pub fn backup_finish(&self, metadata: &BackupMetadata) -> Result<()> {
        let report = BackupInfo {
            backup_id: self.backup_id,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: self.started_at,
            end_time: now_secs(),
            lock_time: self.lock_time.as_secs(),
            from_lsn: metadata.from_lsn,
            to_lsn: metadata.to_lsn,
            last_lsn: metadata.last_lsn,
            incremental: metadata.backup_type == BackupType::Incremental,
            partial: self.filter.is_active(),
            binlog_position: self.binlog_position.clone(),
        };
        report.write(&self.sink)?;
        self.target.release()?;
        info!(target_dir = %self.target.path().display(), "backup completed");
        Ok(())
    }
}

/// Tablespaces and empty directories go through the worker pool.
fn selects_data_file(filter: &TableFilter, entry: &DatadirEntry) -> bool {
    match entry.kind {
        EntryKind::File => is_tablespace(&entry.rel_path) && !filter.skips(&entry.rel_path),
        EntryKind::EmptyDir => !skips_dir(filter, &entry.rel_path),
    }
}

fn skips_dir(filter: &TableFilter, rel_path: &Path) -> bool {
    if rel_path.components().count() == 1 {
        return rel_path
            .to_str()
            .is_some_and(|db| filter.is_active() && filter.skips_database(db));
    }
    filter.skips(rel_path)
}

/// Everything else except the redo log, bitmap files and our own lock.
fn selects_plain_file(filter: &TableFilter, entry: &DatadirEntry) -> bool {
    if entry.kind != EntryKind::File || is_tablespace(&entry.rel_path) {
        return false;
    }
    if entry.rel_path.components().count() == 1 {
        let name = entry.file_name().unwrap_or_default();
        if name.starts_with("ib_logfile") || is_bitmap_file(name) || name == LOCK_FILE {
            return false;
        }
    }
    !filter.skips(&entry.rel_path)
}

fn abandon_tailer(tailer: TailerHandle) {
    if let Err(err) = tailer.stop() {
        warn!(error = %err, "redo tailer failed while aborting backup");
    }
}
