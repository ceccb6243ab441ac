//! On-disk changed page bitmap block.

use crate::page::{be_u32, be_u64, put_be_u32, put_be_u64};

pub const BLOCK_SIZE: usize = 4096;

pub const IS_LAST_BLOCK: usize = 0;
pub const START_LSN: usize = 4;
pub const END_LSN: usize = 12;
pub const SPACE_ID: usize = 20;
pub const FIRST_PAGE_ID: usize = 24;
pub const BITMAP_OFFSET: usize = 32;
pub const BITMAP_END: usize = BLOCK_SIZE - 8;
pub const CHECKSUM: usize = BLOCK_SIZE - 4;

/// Number of 64-bit words in the payload.
pub const BITMAP_WORDS: usize = (BITMAP_END - BITMAP_OFFSET) / 8;
/// Page ids covered by one block.
pub const PAGES_PER_BLOCK: usize = BITMAP_WORDS * 64;

/// Fold checksum over everything before the checksum field.
pub fn block_checksum(block: &[u8]) -> u32 {
    let mut sum: u64 = 1;
    let mut shift = 0u32;
    for &b in &block[..CHECKSUM] {
        let b = u64::from(b);
        sum &= 0x7FFF_FFFF;
        sum += b;
        sum += b << shift;
        shift += 1;
        if shift > 24 {
            shift = 0;
        }
    }
    sum as u32
}

/// One bitmap block: which of `PAGES_PER_BLOCK` pages starting at
/// `first_page_id` changed during `[start_lsn, end_lsn]`.
#[derive(Clone, PartialEq, Eq)]
pub struct BitmapBlock {
    bytes: Box<[u8]>,
}

impl std::fmt::Debug for BitmapBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmapBlock")
            .field("space_id", &self.space_id())
            .field("first_page_id", &self.first_page_id())
            .field("start_lsn", &self.start_lsn())
            .field("end_lsn", &self.end_lsn())
            .field("last_in_run", &self.is_last_in_run())
            .finish()
    }
}

impl BitmapBlock {
    pub fn new(
        space_id: u32,
        first_page_id: u32,
        start_lsn: u64,
        end_lsn: u64,
        last_in_run: bool,
    ) -> Self {
        let mut bytes = vec![0u8; BLOCK_SIZE].into_boxed_slice();
        put_be_u32(&mut bytes, IS_LAST_BLOCK, u32::from(last_in_run));
        put_be_u64(&mut bytes, START_LSN, start_lsn);
        put_be_u64(&mut bytes, END_LSN, end_lsn);
        put_be_u32(&mut bytes, SPACE_ID, space_id);
        put_be_u32(&mut bytes, FIRST_PAGE_ID, first_page_id);
        Self { bytes }
    }

    /// Wrap a raw block; `raw` must be exactly `BLOCK_SIZE` bytes.
    pub fn from_bytes(raw: &[u8]) -> Self {
        debug_assert_eq!(raw.len(), BLOCK_SIZE);
        Self {
            bytes: raw.to_vec().into_boxed_slice(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_last_in_run(&self) -> bool {
        be_u32(&self.bytes, IS_LAST_BLOCK) != 0
    }

    pub fn start_lsn(&self) -> u64 {
        be_u64(&self.bytes, START_LSN)
    }

    pub fn end_lsn(&self) -> u64 {
        be_u64(&self.bytes, END_LSN)
    }

    pub fn space_id(&self) -> u32 {
        be_u32(&self.bytes, SPACE_ID)
    }

    pub fn first_page_id(&self) -> u32 {
        be_u32(&self.bytes, FIRST_PAGE_ID)
    }

    pub fn key(&self) -> (u32, u32) {
        (self.space_id(), self.first_page_id())
    }

    pub fn checksum_ok(&self) -> bool {
        be_u32(&self.bytes, CHECKSUM) == block_checksum(&self.bytes)
    }

    /// Recompute and store the checksum.
    pub fn seal(&mut self) {
        let sum = block_checksum(&self.bytes);
        put_be_u32(&mut self.bytes, CHECKSUM, sum);
    }

    fn word(&self, idx: usize) -> u64 {
        let off = BITMAP_OFFSET + idx * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[off..off + 8]);
        u64::from_le_bytes(raw)
    }

    fn set_word(&mut self, idx: usize, value: u64) {
        let off = BITMAP_OFFSET + idx * 8;
        self.bytes[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Bit `i` of the payload, i.e. page `first_page_id + i`.
    pub fn bit(&self, i: usize) -> bool {
        self.word(i >> 6) & (1u64 << (i & 63)) != 0
    }

    /// Mark `page_id` changed; false when it is outside this block.
    pub fn set_page(&mut self, page_id: u32) -> bool {
        let first = self.first_page_id();
        if page_id < first {
            return false;
        }
        let i = (page_id - first) as usize;
        if i >= PAGES_PER_BLOCK {
            return false;
        }
        let w = self.word(i >> 6) | (1u64 << (i & 63));
        self.set_word(i >> 6, w);
        true
    }

    /// OR another block's payload into this one. Header fields are left
    /// untouched; both blocks must describe the same key.
    pub fn merge(&mut self, other: &BitmapBlock) {
        debug_assert_eq!(self.key(), other.key());
        for idx in 0..BITMAP_WORDS {
            let w = self.word(idx) | other.word(idx);
            self.set_word(idx, w);
        }
    }
}
