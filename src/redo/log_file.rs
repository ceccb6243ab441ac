//! Circular redo log file.
//!
//! Layout: a 2048-byte header (format and start LSN in the first block,
//! checkpoint records in the second and fourth) followed by a circular data
//! area. LSN `l` is stored at `2048 + (l - start_lsn) % capacity`.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use tracing::debug;

use super::LOG_BLOCK_SIZE;
use crate::{
    page::{be_u32, be_u64, put_be_u32, put_be_u64, read_full_at},
    Error, Result,
};

pub const LOG_FILE_HDR_SIZE: u64 = 2048;
pub const LOG_FORMAT: u32 = 1;

const LOG_HEADER_FORMAT: usize = 0;
const LOG_HEADER_START_LSN: usize = 8;
const LOG_CHECKPOINT_NO: usize = 0;
const LOG_CHECKPOINT_LSN: usize = 8;
const LOG_CHECKPOINT_OFFSETS: [u64; 2] = [512, 1536];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub no: u64,
    pub lsn: u64,
}

#[derive(Debug)]
pub struct RedoLogFile {
    file: File,
    path: PathBuf,
    start_lsn: u64,
    capacity: u64,
}

fn header_block(start_lsn: u64) -> Vec<u8> {
    let mut block = vec![0u8; LOG_BLOCK_SIZE];
    put_be_u32(&mut block, LOG_HEADER_FORMAT, LOG_FORMAT);
    put_be_u64(&mut block, LOG_HEADER_START_LSN, start_lsn);
    let sum = super::block_checksum(&block);
    put_be_u32(&mut block, super::LOG_BLOCK_CHECKSUM, sum);
    block
}

impl RedoLogFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
        Self::from_file(file, path)
    }

    fn from_file(file: File, path: &Path) -> Result<Self> {
        let len = file.metadata().map_err(|e| Error::io_at(path, e))?.len();
        if len <= LOG_FILE_HDR_SIZE || len % LOG_BLOCK_SIZE as u64 != 0 {
            return Err(Error::corrupt(path, format!("invalid redo log size {len}")).into());
        }
        let mut block = vec![0u8; LOG_BLOCK_SIZE];
        read_full_at(&file, &mut block, 0).map_err(|e| Error::io_at(path, e))?;
        if !super::block_checksum_ok(&block) {
            return Err(Error::corrupt(path, "redo log header checksum mismatch").into());
        }
        let format = be_u32(&block, LOG_HEADER_FORMAT);
        if format != LOG_FORMAT {
            return Err(Error::corrupt(path, format!("unsupported redo log format {format}")).into());
        }
        let start_lsn = be_u64(&block, LOG_HEADER_START_LSN);
        if start_lsn % LOG_BLOCK_SIZE as u64 != 0 {
            return Err(Error::corrupt(path, format!("unaligned start LSN {start_lsn}")).into());
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            start_lsn,
            capacity: len - LOG_FILE_HDR_SIZE,
        })
    }

    /// Create a zero-filled log whose data area starts at `start_lsn`.
    pub fn create(path: &Path, start_lsn: u64, capacity: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::io_at(path, e))?;
        file.set_len(LOG_FILE_HDR_SIZE + capacity)
            .map_err(|e| Error::io_at(path, e))?;
        file.write_all_at(&header_block(start_lsn), 0)
            .map_err(|e| Error::io_at(path, e))?;
        Self::from_file(file, path)
    }

    /// Open for writing blocks and checkpoints.
    pub fn open_rw(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io_at(path, e))?;
        Self::from_file(file, path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_lsn(&self) -> u64 {
        self.start_lsn
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn offset_of(&self, lsn: u64) -> Result<u64> {
        if lsn < self.start_lsn {
            return Err(Error::Inconsistent(format!(
                "LSN {lsn} is before the start of redo log {} ({})",
                self.path.display(),
                self.start_lsn
            ))
            .into());
        }
        Ok(LOG_FILE_HDR_SIZE + (lsn - self.start_lsn) % self.capacity)
    }

    /// Newest checkpoint record with a valid checksum.
    pub fn read_checkpoint(&self) -> Result<Checkpoint> {
        let mut best: Option<Checkpoint> = None;
        for off in LOG_CHECKPOINT_OFFSETS {
            let mut block = vec![0u8; LOG_BLOCK_SIZE];
            read_full_at(&self.file, &mut block, off).map_err(|e| Error::io_at(&self.path, e))?;
            if !super::block_checksum_ok(&block) {
                continue;
            }
            let cp = Checkpoint {
                no: be_u64(&block, LOG_CHECKPOINT_NO),
                lsn: be_u64(&block, LOG_CHECKPOINT_LSN),
            };
            if cp.no == 0 && cp.lsn == 0 {
                continue;
            }
            if best.map_or(true, |b| cp.no > b.no) {
                best = Some(cp);
            }
        }
        let cp = best.ok_or_else(|| Error::corrupt(&self.path, "no valid checkpoint record"))?;
        debug!(path = %self.path.display(), checkpoint_no = cp.no, lsn = cp.lsn, "read checkpoint");
        Ok(cp)
    }

    /// Record a checkpoint; consecutive numbers alternate between slots.
    pub fn write_checkpoint(&self, cp: Checkpoint) -> Result<()> {
        let mut block = vec![0u8; LOG_BLOCK_SIZE];
        put_be_u64(&mut block, LOG_CHECKPOINT_NO, cp.no);
        put_be_u64(&mut block, LOG_CHECKPOINT_LSN, cp.lsn);
        let sum = super::block_checksum(&block);
        put_be_u32(&mut block, super::LOG_BLOCK_CHECKSUM, sum);
        let off = LOG_CHECKPOINT_OFFSETS[(cp.no % 2) as usize];
        self.file
            .write_all_at(&block, off)
            .map_err(|e| Error::io_at(&self.path, e))?;
        Ok(())
    }

    /// Read whole blocks starting at the block-aligned `lsn`, wrapping
    /// around the end of the data area.
    pub fn read_blocks(&self, lsn: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() as u64 > self.capacity {
            return Err(Error::Inconsistent("redo read larger than the log".into()).into());
        }
        let off = self.offset_of(lsn)?;
        let until_end = (LOG_FILE_HDR_SIZE + self.capacity - off) as usize;
        let first = buf.len().min(until_end);
        let (head, tail) = buf.split_at_mut(first);
        self.read_exact_at(head, off)?;
        if !tail.is_empty() {
            self.read_exact_at(tail, LOG_FILE_HDR_SIZE)?;
        }
        Ok(())
    }

    fn read_exact_at(&self, buf: &mut [u8], off: u64) -> Result<()> {
        let n = read_full_at(&self.file, buf, off).map_err(|e| Error::io_at(&self.path, e))?;
        if n != buf.len() {
            return Err(Error::corrupt(&self.path, format!("short read at offset {off}")).into());
        }
        Ok(())
    }

    /// Write whole blocks starting at the block-aligned `lsn`.
    pub fn write_blocks(&self, lsn: u64, data: &[u8]) -> Result<()> {
        for (i, block) in data.chunks(LOG_BLOCK_SIZE).enumerate() {
            let off = self.offset_of(lsn + (i * LOG_BLOCK_SIZE) as u64)?;
            self.file
                .write_all_at(block, off)
                .map_err(|e| Error::io_at(&self.path, e))?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::io_at(&self.path, e))?;
        Ok(())
    }
}

/// Header for a backup copy of the log whose blocks start at `start_lsn`
/// and whose checkpoint is `checkpoint_lsn`.
pub fn backup_log_header(start_lsn: u64, checkpoint_lsn: u64) -> Vec<u8> {
    let mut header = vec![0u8; LOG_FILE_HDR_SIZE as usize];
    header[..LOG_BLOCK_SIZE].copy_from_slice(&header_block(start_lsn));
    let cp = &mut header[512..1024];
    put_be_u64(cp, LOG_CHECKPOINT_NO, 1);
    put_be_u64(cp, LOG_CHECKPOINT_LSN, checkpoint_lsn);
    let sum = super::block_checksum(cp);
    put_be_u32(cp, super::LOG_BLOCK_CHECKSUM, sum);
    header
}
