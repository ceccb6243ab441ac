use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use hotbackup::{
    backup::{
        info::{BackupInfo, BINLOG_INFO_FILE},
        BackupMetadata, BackupSession, HotBackup, LocalSession, LockMarker, LOCK_FILE,
        METADATA_FILE,
    },
    config::BackupConfig,
    delta::DeltaReader,
    error_kind,
    redo::BACKUP_LOG_FILE,
    Error, ErrorKind,
};
use tempfile::tempdir;
use uuid::Uuid;

#[path = "../common/mod.rs"]
mod common;

use common::{
    bitmap_block, extend_tablespace, list_files, touch_page, write_bitmap_file, write_redo,
    write_tablespace, PAGE_SIZE,
};

/// A small data directory checkpointed at LSN 5000 with log up to 5100.
fn make_datadir(dir: &Path) -> hotbackup::Result<()> {
    write_tablespace(&dir.join("ibdata1"), 0, &[100, 200, 300, 400])?;
    write_tablespace(&dir.join("db1/t1.ibd"), 11, &[100, 200, 300, 400])?;
    write_tablespace(&dir.join("db1/t2.ibd"), 12, &[100, 100, 100])?;
    write_tablespace(&dir.join("db3/t3.ibd"), 13, &[100, 100])?;
    fs::write(dir.join("db1/t1.frm"), b"frm-t1")?;
    fs::create_dir_all(dir.join("db2"))?;
    write_redo(dir, 5000, 5100)?;
    Ok(())
}

/// Pages written after the full backup, checkpointed at LSN 9000.
fn modify_datadir(dir: &Path) -> hotbackup::Result<()> {
    touch_page(&dir.join("db1/t1.ibd"), 2, 7000)?;
    extend_tablespace(&dir.join("db1/t2.ibd"), 2, 7500)?;
    write_redo(dir, 9000, 9100)?;
    Ok(())
}

fn full_backup(datadir: &Path, target: &Path) -> hotbackup::Result<BackupMetadata> {
    let mut session = LocalSession::new(datadir);
    let report = HotBackup::new(BackupConfig::new(datadir, target), &mut session)?.run()?;
    assert!(!session.is_locked());
    Ok(report.metadata)
}

fn delta_page_ids(path: &Path) -> hotbackup::Result<Vec<u32>> {
    let mut reader = DeltaReader::open(path, PAGE_SIZE)?;
    let mut ids = Vec::new();
    while let Some(cluster) = reader.next_cluster()? {
        ids.extend(cluster.page_ids);
    }
    Ok(ids)
}

#[test]
fn full_backup_copies_data_and_records_checkpoint() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let root = tempdir()?;
    make_datadir(datadir.path())?;
    let target = root.path().join("full");

    let metadata = full_backup(datadir.path(), &target)?;
    assert_eq!(metadata, BackupMetadata::full(5000, 5100));
    assert_eq!(BackupMetadata::load(&target)?, metadata);

    for rel in ["ibdata1", "db1/t1.ibd", "db1/t2.ibd", "db3/t3.ibd", "db1/t1.frm"] {
        assert_eq!(
            fs::read(target.join(rel))?,
            fs::read(datadir.path().join(rel))?,
            "{rel}"
        );
    }
    assert!(target.join("db2").is_dir());
    assert!(target.join(BACKUP_LOG_FILE).exists());
    assert!(!target.join("ib_logfile0").exists());
    assert!(!target.join(LOCK_FILE).exists());

    let info = BackupInfo::load(&target)?;
    assert!(!info.incremental);
    assert!(!info.partial);
    assert_eq!((info.from_lsn, info.to_lsn, info.last_lsn), (0, 5000, 5100));
    assert!(info.binlog_position.is_none());
    Ok(())
}

#[test]
fn incremental_backup_keeps_only_newer_pages() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let root = tempdir()?;
    make_datadir(datadir.path())?;
    let full = root.path().join("full");
    full_backup(datadir.path(), &full)?;
    modify_datadir(datadir.path())?;

    let inc = root.path().join("inc1");
    let mut config = BackupConfig::new(datadir.path(), &inc);
    config.incremental_basedir = Some(full.clone());
    config.parallel = 2;
    let mut session = LocalSession::new(datadir.path());
    let report = HotBackup::new(config, &mut session)?.run()?;

    assert_eq!(report.metadata, BackupMetadata::incremental(5000, 9000, 9100));
    assert!(!report.used_bitmaps);
    assert_eq!(delta_page_ids(&inc.join("db1/t1.ibd.delta"))?, vec![2]);
    assert_eq!(delta_page_ids(&inc.join("db1/t2.ibd.delta"))?, vec![0, 3, 4]);
    assert!(delta_page_ids(&inc.join("ibdata1.delta"))?.is_empty());
    assert!(inc.join("db1/t1.ibd.meta").exists());
    assert!(!inc.join("db1/t1.ibd").exists());
    assert_eq!(fs::read(inc.join("db1/t1.frm"))?, b"frm-t1");
    assert!(BackupInfo::load(&inc)?.incremental);
    Ok(())
}

#[test]
fn incremental_backup_reads_only_pages_in_bitmaps() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let root = tempdir()?;
    make_datadir(datadir.path())?;
    let full = root.path().join("full");
    full_backup(datadir.path(), &full)?;
    modify_datadir(datadir.path())?;
    let bitmap = write_bitmap_file(
        datadir.path(),
        1,
        5000,
        &[
            bitmap_block(11, 0, 5000, 9000, false, &[2]),
            bitmap_block(12, 0, 5000, 9000, true, &[0, 3, 4]),
        ],
    )?;

    let inc = root.path().join("inc1");
    let mut config = BackupConfig::new(datadir.path(), &inc);
    config.incremental_lsn = Some(5000);
    let mut session = LocalSession::new(datadir.path());
    let report = HotBackup::new(config, &mut session)?.run()?;

    assert!(report.used_bitmaps);
    assert_eq!(report.copy.pages_written, 4);
    assert_eq!(delta_page_ids(&inc.join("db1/t1.ibd.delta"))?, vec![2]);
    assert_eq!(delta_page_ids(&inc.join("db1/t2.ibd.delta"))?, vec![0, 3, 4]);
    let bitmap_name = bitmap.file_name().map(PathBuf::from).unwrap_or_default();
    assert!(!list_files(&inc).contains(&bitmap_name));
    Ok(())
}

#[test]
fn incremental_lsn_past_checkpoint_is_inconsistent() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let root = tempdir()?;
    make_datadir(datadir.path())?;

    let mut config = BackupConfig::new(datadir.path(), root.path().join("inc"));
    config.incremental_lsn = Some(6000);
    let mut session = LocalSession::new(datadir.path());
    let err = HotBackup::new(config, &mut session)?.run().unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Inconsistent));
    Ok(())
}

#[test]
fn non_empty_target_is_refused() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let target = tempdir()?;
    make_datadir(datadir.path())?;
    fs::write(target.path().join("leftover"), b"x")?;

    let mut session = LocalSession::new(datadir.path());
    let err = HotBackup::new(BackupConfig::new(datadir.path(), target.path()), &mut session)
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::TargetNotEmpty(_))));
    Ok(())
}

#[test]
fn target_locked_by_live_backup_is_busy() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let target = tempdir()?;
    make_datadir(datadir.path())?;
    let marker = LockMarker {
        backup_id: Uuid::new_v4(),
        pid: std::process::id() as i32,
        started_at: 0,
    };
    fs::write(target.path().join(LOCK_FILE), serde_json::to_vec(&marker)?)?;

    let mut session = LocalSession::new(datadir.path());
    let err = HotBackup::new(BackupConfig::new(datadir.path(), target.path()), &mut session)
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::TargetBusy(_))));
    Ok(())
}

#[test]
fn stale_lock_from_dead_backup_is_replaced() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let target = tempdir()?;
    make_datadir(datadir.path())?;
    let marker = LockMarker {
        backup_id: Uuid::new_v4(),
        pid: 0,
        started_at: 0,
    };
    fs::write(target.path().join(LOCK_FILE), serde_json::to_vec(&marker)?)?;

    let mut session = LocalSession::new(datadir.path());
    HotBackup::new(BackupConfig::new(datadir.path(), target.path()), &mut session)?.run()?;
    assert!(!target.path().join(LOCK_FILE).exists());
    assert_eq!(BackupMetadata::load(target.path())?.to_lsn, 5000);
    Ok(())
}

#[test]
fn excluded_database_is_left_out() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let root = tempdir()?;
    make_datadir(datadir.path())?;
    let target = root.path().join("partial");

    let mut config = BackupConfig::new(datadir.path(), &target);
    config.filters.databases_exclude = vec!["db3".into()];
    let mut session = LocalSession::new(datadir.path());
    let report = HotBackup::new(config, &mut session)?.run()?;

    assert!(report.partial);
    assert!(!target.join("db3").exists());
    assert!(target.join("db1/t1.ibd").exists());
    assert!(target.join("db2").is_dir());
    assert!(BackupInfo::load(&target)?.partial);
    Ok(())
}

/// Local session that also reports a replication position.
struct ReplicaSession {
    inner: LocalSession,
}

impl BackupSession for ReplicaSession {
    fn lock(&mut self) -> hotbackup::Result<()> {
        self.inner.lock()
    }

    fn checkpoint_lsn(&self) -> hotbackup::Result<u64> {
        self.inner.checkpoint_lsn()
    }

    fn binlog_position(&self) -> Option<String> {
        Some("binlog.000003\t154".into())
    }

    fn unlock(&mut self) -> hotbackup::Result<()> {
        self.inner.unlock()
    }
}

#[test]
fn binlog_position_is_recorded_under_lock() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let root = tempdir()?;
    make_datadir(datadir.path())?;
    let target = root.path().join("full");

    let mut session = ReplicaSession {
        inner: LocalSession::new(datadir.path()),
    };
    let report = HotBackup::new(BackupConfig::new(datadir.path(), &target), &mut session)?.run()?;

    assert!(report.metadata.recover_binlog_info);
    assert_eq!(
        fs::read_to_string(target.join(BINLOG_INFO_FILE))?,
        "binlog.000003\t154\n"
    );
    let text = fs::read_to_string(target.join(METADATA_FILE))?;
    assert!(text.contains("recover_binlog_info = 1"));
    assert_eq!(
        BackupInfo::load(&target)?.binlog_position.as_deref(),
        Some("binlog.000003\t154")
    );
    Ok(())
}

/// Checkpoint moves past the copied log once the lock is taken.
struct RacingSession {
    calls: AtomicUsize,
    locked: bool,
}

impl BackupSession for RacingSession {
    fn lock(&mut self) -> hotbackup::Result<()> {
        self.locked = true;
        Ok(())
    }

    fn checkpoint_lsn(&self) -> hotbackup::Result<u64> {
        Ok(match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => 5000,
            _ => 6000,
        })
    }

    fn unlock(&mut self) -> hotbackup::Result<()> {
        self.locked = false;
        Ok(())
    }
}

#[test]
fn log_short_of_end_checkpoint_is_inconsistent() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let root = tempdir()?;
    make_datadir(datadir.path())?;

    let mut session = RacingSession {
        calls: AtomicUsize::new(0),
        locked: false,
    };
    let config = BackupConfig::new(datadir.path(), root.path().join("full"));
    let err = HotBackup::new(config, &mut session)?.run().unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Inconsistent));
    assert!(!session.locked);
    Ok(())
}

/// Drops a table right before the lock is granted, after its file was
/// already copied.
struct DropOnLock {
    inner: LocalSession,
    victim: PathBuf,
}

impl BackupSession for DropOnLock {
    fn lock(&mut self) -> hotbackup::Result<()> {
        fs::remove_file(&self.victim)?;
        self.inner.lock()
    }

    fn checkpoint_lsn(&self) -> hotbackup::Result<u64> {
        self.inner.checkpoint_lsn()
    }

    fn unlock(&mut self) -> hotbackup::Result<()> {
        self.inner.unlock()
    }
}

#[test]
fn table_dropped_during_backup_is_left_out() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let root = tempdir()?;
    make_datadir(datadir.path())?;
    let target = root.path().join("full");

    let mut session = DropOnLock {
        inner: LocalSession::new(datadir.path()),
        victim: datadir.path().join("db3/t3.ibd"),
    };
    HotBackup::new(BackupConfig::new(datadir.path(), &target), &mut session)?.run()?;

    assert!(!target.join("db3/t3.ibd").exists());
    assert!(target.join("db1/t1.ibd").exists());
    assert!(target.join("ibdata1").exists());
    Ok(())
}

#[test]
fn table_dropped_during_incremental_loses_its_delta() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let root = tempdir()?;
    make_datadir(datadir.path())?;
    let full = root.path().join("full");
    full_backup(datadir.path(), &full)?;
    modify_datadir(datadir.path())?;

    let inc = root.path().join("inc1");
    let mut config = BackupConfig::new(datadir.path(), &inc);
    config.incremental_basedir = Some(full);
    let mut session = DropOnLock {
        inner: LocalSession::new(datadir.path()),
        victim: datadir.path().join("db1/t2.ibd"),
    };
    HotBackup::new(config, &mut session)?.run()?;

    assert!(!inc.join("db1/t2.ibd.delta").exists());
    assert!(!inc.join("db1/t2.ibd.meta").exists());
    assert_eq!(delta_page_ids(&inc.join("db1/t1.ibd.delta"))?, vec![2]);
    Ok(())
}
