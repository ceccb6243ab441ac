//! Turning backups back into a data directory: merging incrementals into a
//! full backup (`prepare`) and copying the result into place
//! (`copy_back`).

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::{
    backup::{
        info::{BINLOG_INFO_FILE, INFO_FILE},
        target::TargetDir, BackupChain, BackupMetadata, BackupType, LOCK_FILE,
        METADATA_FILE,
    },
    copy::{copy_plain_file, is_tablespace, DatadirEntry, DatadirIterator, EntryKind},
    datasink::{Datasink, LocalDatasink},
    delta::{
        apply::{is_quarantine_name, ApplyStats},
        delta_path, strip_delta_suffix, DeltaApplier, DELTA_SUFFIX, META_SUFFIX,
    },
    Error, Result,
};

const BOOKKEEPING_PREFIX: &str = "hotbackup_";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub incrementals: usize,
    pub deltas: ApplyStats,
    pub removed_tablespaces: usize,
    pub to_lsn: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyBackReport {
    pub files: u64,
    pub bytes: u64,
    pub dirs: u64,
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.to_str().is_some_and(|s| s.ends_with(suffix))
}

/// Files of a backup directory that describe the backup rather than belong
/// to the data directory.
fn is_bookkeeping(rel_path: &Path) -> bool {
    if has_suffix(rel_path, DELTA_SUFFIX) || has_suffix(rel_path, META_SUFFIX) {
        return true;
    }
    let Some(name) = rel_path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if is_quarantine_name(name) {
        return true;
    }
    rel_path.components().count() == 1 && (name.starts_with(BOOKKEEPING_PREFIX) || name == LOCK_FILE)
}

/// Merge `incremental_dirs`, oldest first, into the full backup in
/// `target_dir`.
#[instrument(skip_all, fields(target_dir = %target_dir.display(), incrementals = incremental_dirs.len()))]
pub fn prepare(target_dir: &Path, incremental_dirs: &[PathBuf]) -> Result<PrepareReport> {
    let chain = BackupChain::resolve(target_dir, incremental_dirs)?;
    chain.ensure_valid()?;

    let mut report = PrepareReport {
        incrementals: incremental_dirs.len(),
        to_lsn: chain.base().metadata.to_lsn,
        ..PrepareReport::default()
    };
    let mut metadata = chain.base().metadata.clone();

    for inc in chain.incrementals() {
        let stats = apply_incremental(target_dir, &inc.dir)?;
        report.deltas.deltas += stats.deltas;
        report.deltas.clusters += stats.clusters;
        report.deltas.pages += stats.pages;
        report.removed_tablespaces += remove_dropped_tablespaces(target_dir, &inc.dir)?;
        apply_log_finish(target_dir, &inc.dir)?;

        metadata.to_lsn = inc.metadata.to_lsn;
        metadata.last_lsn = inc.metadata.last_lsn;
        metadata.recover_binlog_info = inc.metadata.recover_binlog_info;
        metadata.backup_type = BackupType::LogApplied;
        metadata.store(target_dir)?;
        info!(
            incremental = %inc.dir.display(),
            to_lsn = metadata.to_lsn,
            pages = stats.pages,
            "incremental applied"
        );
    }

    if metadata.backup_type != BackupType::LogApplied {
        metadata.backup_type = BackupType::LogApplied;
        metadata.store(target_dir)?;
    }
    report.to_lsn = metadata.to_lsn;
    Ok(report)
}

/// Apply every `.delta` of `inc_dir` to the matching file of `target_dir`.
pub fn apply_incremental(target_dir: &Path, inc_dir: &Path) -> Result<ApplyStats> {
    let applier = DeltaApplier::new(target_dir);
    let mut total = ApplyStats::default();
    for delta in delta_files(inc_dir)? {
        let rel = delta.strip_prefix(inc_dir).unwrap_or(&delta);
        let Some(base_rel) = strip_delta_suffix(rel) else {
            continue;
        };
        let stats = applier.apply(&target_dir.join(&base_rel), std::slice::from_ref(&delta))?;
        total.deltas += stats.deltas;
        total.clusters += stats.clusters;
        total.pages += stats.pages;
    }
    Ok(total)
}

fn delta_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_default();
            Error::io_at(path, std::io::Error::from(e))
        })?;
        if entry.file_type().is_file() && has_suffix(entry.path(), DELTA_SUFFIX) {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

/// Remove single-table tablespaces the incremental no longer has, which
/// were dropped between the two backups.
fn remove_dropped_tablespaces(target_dir: &Path, inc_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in WalkDir::new(target_dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().map_or(true, |ext| ext != "ibd") {
            continue;
        }
        let rel = path.strip_prefix(target_dir).unwrap_or(path);
        if inc_dir.join(delta_path(rel)).exists() {
            continue;
        }
        fs::remove_file(path).map_err(|e| Error::io_at(path, e))?;
        debug!(path = %rel.display(), "removed tablespace absent from incremental");
        removed += 1;
    }
    Ok(removed)
}

/// Replace the full backup's non-tablespace files with the incremental's.
/// A replication position recorded only by an older backup is dropped too.
#[instrument(skip_all, fields(target_dir = %target_dir.display(), inc_dir = %inc_dir.display()))]
pub fn apply_log_finish(target_dir: &Path, inc_dir: &Path) -> Result<()> {
    let stale = |entry: &DatadirEntry| {
        entry.kind == EntryKind::File
            && !is_tablespace(&entry.rel_path)
            && (!is_bookkeeping(&entry.rel_path)
                || entry.rel_path == Path::new(BINLOG_INFO_FILE))
            && !inc_dir.join(&entry.rel_path).exists()
    };
    let iter = DatadirIterator::new(target_dir, &stale);
    while let Some(entry) = iter.next_entry()? {
        fs::remove_file(&entry.path).map_err(|e| Error::io_at(&entry.path, e))?;
        debug!(path = %entry.rel_path.display(), "removed stale file");
    }
    remove_stale_dirs(target_dir, inc_dir)?;

    let sink = LocalDatasink::new(target_dir);
    let wanted = |entry: &DatadirEntry| match entry.kind {
        EntryKind::EmptyDir => true,
        EntryKind::File => {
            !is_tablespace(&entry.rel_path)
                && !has_suffix(&entry.rel_path, DELTA_SUFFIX)
                && !has_suffix(&entry.rel_path, META_SUFFIX)
                && !matches!(
                    entry.rel_path.to_str(),
                    Some(METADATA_FILE | INFO_FILE | LOCK_FILE)
                )
        }
    };
    let iter = DatadirIterator::new(inc_dir, &wanted);
    let mut files = 0u64;
    while let Some(entry) = iter.next_entry()? {
        match entry.kind {
            EntryKind::EmptyDir => sink.mkdir(&entry.rel_path)?,
            EntryKind::File => {
                copy_plain_file(&entry.path, &entry.rel_path, &sink)?;
                files += 1;
            }
        }
    }
    debug!(files, "incremental files copied");
    Ok(())
}

/// Drop empty directories of the full backup that the incremental lacks.
fn remove_stale_dirs(target_dir: &Path, inc_dir: &Path) -> Result<()> {
    for entry in WalkDir::new(target_dir)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let rel = entry.path().strip_prefix(target_dir).unwrap_or(entry.path());
        if inc_dir.join(rel).is_dir() {
            continue;
        }
        let empty = fs::read_dir(entry.path())
            .map_err(|e| Error::io_at(entry.path(), e))?
            .next()
            .is_none();
        if empty {
            fs::remove_dir(entry.path()).map_err(|e| Error::io_at(entry.path(), e))?;
        }
    }
    Ok(())
}

/// Copy a prepared backup into `datadir`, which must be empty unless
/// `force` is set.
#[instrument(skip_all, fields(backup_dir = %backup_dir.display(), datadir = %datadir.display(), force))]
pub fn copy_back(backup_dir: &Path, datadir: &Path, force: bool) -> Result<CopyBackReport> {
    let metadata = BackupMetadata::load(backup_dir)?;
    if metadata.backup_type == BackupType::Incremental {
        return Err(Error::Inconsistent(format!(
            "{} is an incremental backup; prepare it into its full backup first",
            backup_dir.display()
        ))
        .into());
    }
    if metadata.backup_type == BackupType::Full {
        warn!("copying back a backup that has not been prepared");
    }

    let target = TargetDir::new(datadir);
    if force {
        if datadir.exists() && !datadir.is_dir() {
            return Err(Error::InvalidTargetDir(datadir.display().to_string()).into());
        }
    } else {
        target.validate_empty()?;
    }
    fs::create_dir_all(datadir).map_err(|e| Error::io_at(datadir, e))?;

    let sink = LocalDatasink::new(datadir);
    let select = |entry: &DatadirEntry| !is_bookkeeping(&entry.rel_path);
    let iter = DatadirIterator::new(backup_dir, &select);
    let mut report = CopyBackReport::default();
    while let Some(entry) = iter.next_entry()? {
        match entry.kind {
            EntryKind::EmptyDir => {
                sink.mkdir(&entry.rel_path)?;
                report.dirs += 1;
            }
            EntryKind::File => {
                report.bytes += copy_plain_file(&entry.path, &entry.rel_path, &sink)?;
                report.files += 1;
            }
        }
    }
    info!(files = report.files, bytes = report.bytes, "backup copied back");
    Ok(report)
}
