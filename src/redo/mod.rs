//! Redo log block format and the tailer copying it during a backup.
//!
//! The log is a sequence of 512-byte blocks addressed by LSN. A block
//! header holds the block number (with a flush flag in the top bit), the
//! number of bytes in use including the header, the offset of the first
//! record group and the checkpoint number; the last four bytes are a
//! CRC-32C of the rest.

use crate::page::{be_u16, be_u32, put_be_u16, put_be_u32};

pub mod log_file;
pub mod tailer;

pub use log_file::{Checkpoint, RedoLogFile};
pub use tailer::{RedoTailer, TailerHandle, TailerPhase};

pub const REDO_LOG_FILE: &str = "ib_logfile0";
pub const BACKUP_LOG_FILE: &str = "hotbackup_logfile";

pub const LOG_BLOCK_SIZE: usize = 512;
pub const LOG_BLOCK_HDR_SIZE: usize = 12;
pub const LOG_BLOCK_TRL_SIZE: usize = 4;
/// Bytes of a block that can carry log data before the trailer.
pub const LOG_BLOCK_DATA_END: usize = LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE;

pub const LOG_BLOCK_HDR_NO: usize = 0;
pub const LOG_BLOCK_HDR_DATA_LEN: usize = 4;
pub const LOG_BLOCK_FIRST_REC_GROUP: usize = 6;
pub const LOG_BLOCK_CHECKPOINT_NO: usize = 8;
pub const LOG_BLOCK_CHECKSUM: usize = LOG_BLOCK_DATA_END;

pub const LOG_BLOCK_FLUSH_BIT: u32 = 0x8000_0000;
const LOG_BLOCK_NO_MASK: u32 = 0x3FFF_FFFF;

pub fn align_down(lsn: u64) -> u64 {
    lsn - lsn % LOG_BLOCK_SIZE as u64
}

pub fn align_up(lsn: u64) -> u64 {
    align_down(lsn + LOG_BLOCK_SIZE as u64 - 1)
}

/// Block number of the block containing `lsn`.
pub fn block_no_for_lsn(lsn: u64) -> u32 {
    ((lsn / LOG_BLOCK_SIZE as u64) as u32 & LOG_BLOCK_NO_MASK) + 1
}

pub fn block_no(block: &[u8]) -> u32 {
    be_u32(block, LOG_BLOCK_HDR_NO) & !LOG_BLOCK_FLUSH_BIT
}

pub fn block_data_len(block: &[u8]) -> usize {
    usize::from(be_u16(block, LOG_BLOCK_HDR_DATA_LEN))
}

pub fn block_checksum(block: &[u8]) -> u32 {
    crc32c::crc32c(&block[..LOG_BLOCK_CHECKSUM])
}

pub fn block_checksum_ok(block: &[u8]) -> bool {
    be_u32(block, LOG_BLOCK_CHECKSUM) == block_checksum(block)
}

/// Fill in the header of the block starting at `block_lsn` and seal it.
pub fn seal_block(
    block: &mut [u8],
    block_lsn: u64,
    data_len: usize,
    first_rec_group: u16,
    checkpoint_no: u32,
) {
    put_be_u32(block, LOG_BLOCK_HDR_NO, block_no_for_lsn(block_lsn));
    put_be_u16(block, LOG_BLOCK_HDR_DATA_LEN, data_len as u16);
    put_be_u16(block, LOG_BLOCK_FIRST_REC_GROUP, first_rec_group);
    put_be_u32(block, LOG_BLOCK_CHECKPOINT_NO, checkpoint_no);
    let sum = block_checksum(block);
    put_be_u32(block, LOG_BLOCK_CHECKSUM, sum);
}

/// How far a scan may trust a block read at `block_lsn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// All 512 bytes belong to the log.
    Complete,
    /// The block is in use up to `data_len` bytes.
    Partial(usize),
    /// Older data, a torn write or garbage: the log ends before this block.
    End,
    /// The block is from a later lap of the circular log.
    Overwritten,
}

pub fn classify_block(block: &[u8], block_lsn: u64) -> BlockState {
    let expected = block_no_for_lsn(block_lsn);
    let found = block_no(block);
    if found != expected {
        let ahead = found.wrapping_sub(expected) & LOG_BLOCK_NO_MASK;
        if ahead != 0 && ahead < LOG_BLOCK_NO_MASK / 2 && block_checksum_ok(block) {
            return BlockState::Overwritten;
        }
        return BlockState::End;
    }
    if !block_checksum_ok(block) {
        return BlockState::End;
    }
    match block_data_len(block) {
        LOG_BLOCK_SIZE => BlockState::Complete,
        len if (LOG_BLOCK_HDR_SIZE..LOG_BLOCK_DATA_END).contains(&len) => BlockState::Partial(len),
        _ => BlockState::End,
    }
}
