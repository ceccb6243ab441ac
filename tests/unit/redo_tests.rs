use std::{fs, path::Path, time::Duration};

use hotbackup::{
    datasink::{Datasink, LocalDatasink},
    error_kind,
    redo::{
        log_file::LOG_FILE_HDR_SIZE, Checkpoint, RedoLogFile, RedoTailer, TailerPhase,
        BACKUP_LOG_FILE, LOG_BLOCK_SIZE, REDO_LOG_FILE,
    },
    ErrorKind,
};
use tempfile::tempdir;

#[path = "../common/mod.rs"]
mod common;

use common::{append_redo, write_redo};

fn tailer_into(log: RedoLogFile, backup: &Path, checkpoint_lsn: u64) -> hotbackup::Result<RedoTailer> {
    let sink = LocalDatasink::new(backup);
    let out = sink.open(Path::new(BACKUP_LOG_FILE), None)?;
    RedoTailer::new(log, out, checkpoint_lsn)
}

fn log_bytes(datadir: &Path, lsn: u64, len: usize) -> hotbackup::Result<Vec<u8>> {
    let log = RedoLogFile::open(&datadir.join(REDO_LOG_FILE))?;
    let mut buf = vec![0u8; len];
    log.read_blocks(lsn, &mut buf)?;
    Ok(buf)
}

#[test]
fn newest_valid_checkpoint_wins() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(REDO_LOG_FILE);
    let log = RedoLogFile::create(&path, 0, common::REDO_CAPACITY)?;
    log.write_checkpoint(Checkpoint { no: 1, lsn: 100 })?;
    log.write_checkpoint(Checkpoint { no: 2, lsn: 200 })?;
    assert_eq!(log.read_checkpoint()?, Checkpoint { no: 2, lsn: 200 });

    // Tear the record in the even slot.
    let raw = fs::OpenOptions::new().write(true).open(&path)?;
    std::os::unix::fs::FileExt::write_all_at(&raw, &[0xAB], 512 + 9)?;
    let log = RedoLogFile::open(&path)?;
    assert_eq!(log.read_checkpoint()?, Checkpoint { no: 1, lsn: 100 });
    Ok(())
}

#[test]
fn non_log_file_is_corrupt() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(REDO_LOG_FILE);
    fs::write(&path, vec![7u8; 4096])?;
    let err = RedoLogFile::open(&path).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Corrupt));
    Ok(())
}

#[test]
fn final_pass_pads_the_partial_block() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let backup = tempdir()?;
    let log = write_redo(datadir.path(), 5000, 5100)?;

    let mut tailer = tailer_into(log, backup.path(), 5000)?;
    assert_eq!(tailer.phase(), TailerPhase::Initial);
    assert_eq!(tailer.initial_copy()?, 5100);
    assert_eq!(tailer.phase(), TailerPhase::Tailing);
    assert_eq!(tailer.finish(5000)?, 5100);

    let out = fs::read(backup.path().join(BACKUP_LOG_FILE))?;
    assert_eq!(out.len(), LOG_FILE_HDR_SIZE as usize + LOG_BLOCK_SIZE);
    let copied = RedoLogFile::open(&backup.path().join(BACKUP_LOG_FILE))?;
    assert_eq!(copied.start_lsn(), 4608);
    assert_eq!(copied.read_checkpoint()?.lsn, 5000);
    assert_eq!(
        &out[LOG_FILE_HDR_SIZE as usize..],
        &log_bytes(datadir.path(), 4608, LOG_BLOCK_SIZE)?[..]
    );
    Ok(())
}

#[test]
fn tailing_follows_log_growth() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let backup = tempdir()?;
    let log = write_redo(datadir.path(), 5000, 5100)?;

    let mut tailer = tailer_into(log, backup.path(), 5000)?;
    tailer.initial_copy()?;
    let handle = tailer.spawn(Duration::from_millis(10))?;
    assert!(!handle.wait_for_lsn(100_000, Duration::from_millis(50)));

    let writer = RedoLogFile::open_rw(&datadir.path().join(REDO_LOG_FILE))?;
    append_redo(&writer, 5100, 9000)?;
    assert!(handle.wait_for_lsn(9000, Duration::from_secs(10)));
    assert!(handle.scanned_lsn() >= 9000);

    let tailer = handle.stop()?;
    assert_eq!(tailer.finish(9000)?, 9000);

    let out = fs::read(backup.path().join(BACKUP_LOG_FILE))?;
    let blocks_len = 9216 - 4608;
    assert_eq!(out.len(), LOG_FILE_HDR_SIZE as usize + blocks_len);
    assert_eq!(
        &out[LOG_FILE_HDR_SIZE as usize..],
        &log_bytes(datadir.path(), 4608, blocks_len)?[..]
    );
    Ok(())
}

#[test]
fn finish_requires_the_backup_end_lsn() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let backup = tempdir()?;
    let log = write_redo(datadir.path(), 5000, 5100)?;

    let mut tailer = tailer_into(log, backup.path(), 5000)?;
    tailer.initial_copy()?;
    let err = tailer.finish(6000).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Inconsistent));
    Ok(())
}

#[test]
fn missing_checkpoint_block_is_corrupt() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let backup = tempdir()?;
    let log = RedoLogFile::create(
        &datadir.path().join(REDO_LOG_FILE),
        0,
        common::REDO_CAPACITY,
    )?;

    let mut tailer = tailer_into(log, backup.path(), 5000)?;
    let err = tailer.initial_copy().unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Corrupt));
    Ok(())
}

#[test]
fn overwritten_log_is_inconsistent() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let backup = tempdir()?;
    let path = datadir.path().join(REDO_LOG_FILE);
    // Eight blocks: LSN 5632 lands where LSN 1536 lived.
    let log = RedoLogFile::create(&path, 0, 4096)?;
    append_redo(&log, 512, 1536)?;
    append_redo(&log, 5632, 6144)?;

    let mut tailer = tailer_into(log, backup.path(), 600)?;
    let err = tailer.initial_copy().unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Inconsistent));
    Ok(())
}

#[test]
fn finish_before_initial_copy_is_rejected() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let backup = tempdir()?;
    let log = write_redo(datadir.path(), 5000, 5100)?;
    let tailer = tailer_into(log, backup.path(), 5000)?;
    let err = tailer.finish(5000).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Inconsistent));
    Ok(())
}

#[test]
fn copy_follows_log_around_the_end_of_the_file() -> hotbackup::Result<()> {
    // Past one lap of the log, and across the physical end of the file.
    for (checkpoint, end) in [(300_000u64, 330_000u64), (520_000, 530_000)] {
        let datadir = tempdir()?;
        let backup = tempdir()?;
        let log = write_redo(datadir.path(), checkpoint, end)?;
        assert!(end > log.capacity());

        let mut tailer = tailer_into(log, backup.path(), checkpoint)?;
        tailer.initial_copy()?;
        assert_eq!(tailer.finish(checkpoint)?, end);

        let first = checkpoint / LOG_BLOCK_SIZE as u64 * LOG_BLOCK_SIZE as u64;
        let last = end.div_ceil(LOG_BLOCK_SIZE as u64) * LOG_BLOCK_SIZE as u64;
        let blocks_len = (last - first) as usize;
        let out = fs::read(backup.path().join(BACKUP_LOG_FILE))?;
        assert_eq!(out.len(), LOG_FILE_HDR_SIZE as usize + blocks_len, "end {end}");
        assert_eq!(
            &out[LOG_FILE_HDR_SIZE as usize..],
            &log_bytes(datadir.path(), first, blocks_len)?[..],
            "end {end}"
        );
        let copied = RedoLogFile::open(&backup.path().join(BACKUP_LOG_FILE))?;
        assert_eq!(copied.start_lsn(), first);
    }
    Ok(())
}
