//! Bitmap file naming and selection of the files covering an LSN range.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use super::block::{BitmapBlock, BLOCK_SIZE};
use crate::{page::read_full_at, Error, Result};

pub const BITMAP_FILE_STEM: &str = "ib_modified_log";
pub const BITMAP_FILE_EXT: &str = "xdb";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapFile {
    pub path: PathBuf,
    pub seq: u64,
    pub start_lsn: u64,
}

pub fn bitmap_file_name(seq: u64, start_lsn: u64) -> String {
    format!("{BITMAP_FILE_STEM}_{seq}_{start_lsn}.{BITMAP_FILE_EXT}")
}

/// Parse `<stem>_<seq>_<start_lsn>.xdb` into `(seq, start_lsn)`.
pub fn parse_bitmap_file_name(name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix(BITMAP_FILE_STEM)?.strip_prefix('_')?;
    let rest = rest.strip_suffix(BITMAP_FILE_EXT)?.strip_suffix('.')?;
    let (seq, lsn) = rest.split_once('_')?;
    Some((seq.parse().ok()?, lsn.parse().ok()?))
}

pub fn is_bitmap_file(name: &str) -> bool {
    parse_bitmap_file_name(name).is_some()
}

/// Files that may hold data for `[from_lsn, to_lsn)`, indexed by sequence
/// number relative to the first one. A `None` slot is a missing file.
///
/// The first slot is the file with the greatest start LSN not above
/// `from_lsn`; the range runs up to the greatest sequence number among files
/// starting below `to_lsn`.
pub fn bitmap_file_range(dir: &Path, from_lsn: u64, to_lsn: u64) -> Result<Vec<Option<BitmapFile>>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io_at(dir, e))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() && !entry.file_type()?.is_symlink() {
            continue;
        }
        let name = entry.file_name();
        let Some((seq, start_lsn)) = name.to_str().and_then(parse_bitmap_file_name) else {
            continue;
        };
        if start_lsn >= to_lsn {
            continue;
        }
        candidates.push(BitmapFile {
            path: entry.path(),
            seq,
            start_lsn,
        });
    }
    candidates.sort_by_key(|f| f.seq);

    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut first_seq = u64::MAX;
    let mut first_start = u64::MAX;
    let mut last_seq = 0;
    for f in &candidates {
        last_seq = last_seq.max(f.seq);
        if f.start_lsn >= from_lsn || f.start_lsn == first_start || first_start > from_lsn {
            first_start = first_start.min(f.start_lsn);
            first_seq = first_seq.min(f.seq);
        } else if f.start_lsn > first_start {
            first_start = f.start_lsn;
            first_seq = f.seq;
        }
    }

    let count = (last_seq - first_seq + 1) as usize;
    let mut slots: Vec<Option<BitmapFile>> = vec![None; count];
    for f in candidates {
        if f.start_lsn < first_start {
            continue;
        }
        let pos = f.seq.checked_sub(first_seq).map(|p| p as usize);
        match pos {
            Some(pos) if pos < count => slots[pos] = Some(f),
            _ => {
                return Err(Error::corrupt(dir, "inconsistent bitmap file directory").into());
            }
        }
    }
    debug!(
        dir = %dir.display(),
        first_seq,
        last_seq,
        from_lsn,
        to_lsn,
        "bitmap file range selected"
    );
    Ok(slots)
}

/// Sequential block reader over one bitmap file.
#[derive(Debug)]
pub struct BitmapFileReader {
    file: File,
    path: PathBuf,
    size: u64,
    offset: u64,
}

impl BitmapFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
        let size = file.metadata().map_err(|e| Error::io_at(path, e))?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// No complete block left to read.
    pub fn at_eof(&self) -> bool {
        self.size < BLOCK_SIZE as u64 || self.offset > self.size - BLOCK_SIZE as u64
    }

    /// Read the next block; the flag reports whether its checksum matched.
    pub fn read_block(&mut self) -> Result<(BitmapBlock, bool)> {
        let mut raw = vec![0u8; BLOCK_SIZE];
        let n = read_full_at(&self.file, &mut raw, self.offset)
            .map_err(|e| Error::io_at(&self.path, e))?;
        if n != BLOCK_SIZE {
            return Err(Error::corrupt(&self.path, "short bitmap block read").into());
        }
        self.offset += BLOCK_SIZE as u64;
        let block = BitmapBlock::from_bytes(&raw);
        let ok = block.checksum_ok();
        Ok((block, ok))
    }

    /// Checks done when the reader can no longer produce a full block: junk
    /// at the tail is only reported, an unfinished run is an error.
    pub fn check_eof(&self, last_in_run: bool) -> Result<()> {
        if !self.at_eof() {
            return Ok(());
        }
        if self.offset != self.size {
            warn!(path = %self.path.display(), "junk at the end of changed page bitmap file");
        }
        if !last_in_run {
            return Err(Error::corrupt(
                &self.path,
                "bitmap file does not contain a complete run at the end",
            )
            .into());
        }
        Ok(())
    }
}
