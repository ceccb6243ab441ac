//! Data file copy pipeline: cursor, read/write filters and the worker pool
//! driving them.

use std::{
    fs::File,
    io::Read,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::debug;

use crate::{
    datasink::Datasink,
    logging::CopyProgressSnapshot,
    Error, Result,
};

pub mod cursor;
pub mod datadir;
pub mod orchestrator;
pub mod read_filter;
pub mod throttle;
pub mod write_filter;

pub use cursor::FileCursor;
pub use datadir::{DatadirEntry, DatadirIterator, EntryKind};
pub use orchestrator::CopyOrchestrator;
pub use read_filter::{BitmapFiltered, PassThrough, ReadFilter, ReadRange};
pub use throttle::{Throttle, Ticker};
pub use write_filter::{IncrementalDelta, WriteFilter, WriteThrough};

/// Counters shared by every worker of one copy run.
#[derive(Debug, Default)]
pub struct CopyCounters {
    pub files_done: AtomicU64,
    pub files_failed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub pages_written: AtomicU64,
    pub pages_skipped: AtomicU64,
}

impl CopyCounters {
    pub fn snapshot(&self, workers: usize, throttle_waits: u64) -> CopyProgressSnapshot {
        CopyProgressSnapshot {
            workers,
            files_done: self.files_done.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            pages_skipped: self.pages_skipped.load(Ordering::Relaxed),
            throttle_waits,
        }
    }
}

/// Whether a path relative to the data directory names a tablespace:
/// `*.ibd` anywhere, or a system/undo tablespace at the root.
pub fn is_tablespace(rel_path: &Path) -> bool {
    if rel_path.extension().is_some_and(|ext| ext == "ibd") {
        return true;
    }
    if rel_path.components().count() != 1 {
        return false;
    }
    let Some(name) = rel_path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    numbered(name, "ibdata") || numbered(name, "undo")
}

fn numbered(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Copy one tablespace through a read/write filter pair.
pub fn copy_tablespace<R: ReadFilter, W: WriteFilter>(
    entry: &DatadirEntry,
    read_filter: &R,
    write_filter: &W,
    sink: &dyn Datasink,
    throttle: Option<&Throttle>,
    counters: &CopyCounters,
    thread: usize,
) -> Result<()> {
    let mut cursor = FileCursor::open(&entry.path, &entry.rel_path, thread)?;
    let mut ctx = write_filter.init(&cursor, sink)?;
    let mut state = read_filter.init(&cursor);

    while let Some(range) = read_filter.next_range(&mut state, &cursor) {
        if let Some(throttle) = throttle {
            throttle.acquire();
        }
        if !cursor.read_range(range.offset, range.len)? {
            break;
        }
        counters
            .bytes_read
            .fetch_add(cursor.buffer().len() as u64, Ordering::Relaxed);
        write_filter.process(&mut ctx, &cursor, counters)?;
    }

    write_filter.finalize(ctx, &cursor)?;
    debug!(thread, path = %entry.rel_path.display(), "tablespace copied");
    Ok(())
}

/// Stream a non-tablespace file verbatim.
pub fn copy_plain_file(src: &Path, rel_path: &Path, sink: &dyn Datasink) -> Result<u64> {
    let mut file = File::open(src).map_err(|e| Error::io_at(src, e))?;
    let size = file.metadata().map_err(|e| Error::io_at(src, e))?.len();
    let mut out = sink.open(rel_path, Some(size))?;
    let mut buf = vec![0u8; 1 << 20];
    let mut total = 0u64;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io_at(src, e).into()),
        };
        out.write(&buf[..n])?;
        total += n as u64;
    }
    out.close()?;
    Ok(total)
}
