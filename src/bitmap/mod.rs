//! Changed page index built from on-disk bitmap files.
//!
//! The index maps `(space_id, first_page_id)` to a merged [`BitmapBlock`] and
//! answers whether a page changed inside the LSN interval it was built for.
//! It is built once per incremental backup and then shared read-only.

use std::{
    collections::{btree_map, BTreeMap},
    ops::Bound,
    path::Path,
};

use tracing::{info, instrument, warn};

use crate::{Error, Result};

pub mod block;
pub mod files;

pub use block::{BitmapBlock, PAGES_PER_BLOCK};
pub use files::{bitmap_file_name, bitmap_file_range, parse_bitmap_file_name, BitmapFile};

use files::BitmapFileReader;

#[derive(Debug, Default, Clone)]
pub struct ChangedPageIndex {
    blocks: BTreeMap<(u32, u32), BitmapBlock>,
    from_lsn: u64,
    to_lsn: u64,
}

impl ChangedPageIndex {
    pub fn empty(from_lsn: u64, to_lsn: u64) -> Self {
        Self {
            blocks: BTreeMap::new(),
            from_lsn,
            to_lsn,
        }
    }

    pub fn from_lsn(&self) -> u64 {
        self.from_lsn
    }

    pub fn to_lsn(&self) -> u64 {
        self.to_lsn
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Insert a block, OR-ing it into an existing block with the same key.
    pub fn insert(&mut self, block: BitmapBlock) {
        match self.blocks.entry(block.key()) {
            btree_map::Entry::Occupied(mut slot) => slot.get_mut().merge(&block),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(block);
            }
        }
    }

    pub fn block(&self, space_id: u32, first_page_id: u32) -> Option<&BitmapBlock> {
        self.blocks.get(&(space_id, first_page_id))
    }

    /// Build the index for `[from_lsn, to_lsn)` from the bitmap files in
    /// `dir`. `MissingRange` and `Corrupt` mean the bitmaps cannot be used
    /// and the caller should scan every page instead.
    #[instrument(skip_all, fields(dir = %dir.display(), from_lsn, to_lsn))]
    pub fn build(dir: &Path, from_lsn: u64, to_lsn: u64) -> Result<Self> {
        if from_lsn > to_lsn {
            return Err(Error::Inconsistent(format!(
                "incremental LSN {from_lsn} is larger than the checkpoint LSN {to_lsn}"
            ))
            .into());
        }

        let files = bitmap_file_range(dir, from_lsn, to_lsn)?;
        if files.is_empty() && from_lsn != to_lsn {
            return Err(Error::MissingRange {
                start: from_lsn,
                end: to_lsn,
            }
            .into());
        }

        let mut index = Self::empty(from_lsn, to_lsn);
        if from_lsn == to_lsn {
            return Ok(index);
        }

        let first_start = files
            .first()
            .and_then(|f| f.as_ref())
            .map(|f| f.start_lsn)
            .unwrap_or(u64::MAX);
        if first_start > from_lsn {
            return Err(Error::MissingRange {
                start: from_lsn,
                end: first_start,
            }
            .into());
        }

        // Zero-sized files share their start LSN with the next file.
        let mut i = 0;
        while i + 1 < files.len() {
            match (&files[i], &files[i + 1]) {
                (Some(a), Some(b)) if a.start_lsn == b.start_lsn => i += 1,
                _ => break,
            }
        }

        let Some(first) = files[i].as_ref() else {
            return Err(Error::MissingRange {
                start: from_lsn,
                end: to_lsn,
            }
            .into());
        };
        let mut reader = BitmapFileReader::open(&first.path)?;
        if reader.at_eof() {
            return Err(Error::MissingRange {
                start: from_lsn,
                end: to_lsn,
            }
            .into());
        }

        // Find the block where the range starts. The block before it must be
        // sound too, otherwise a torn block may have held the start.
        let mut last_ok = true;
        let mut prev_ok = true;
        let mut current = None;
        let mut end_lsn = 0;
        while end_lsn <= from_lsn && !reader.at_eof() {
            prev_ok = last_ok;
            let (block, ok) = reader.read_block()?;
            last_ok = ok;
            end_lsn = block.end_lsn();
            current = Some(block);
        }
        if !(last_ok && prev_ok) {
            return Err(Error::corrupt(reader.path(), "changed page bitmap file corrupted").into());
        }
        let Some(block) = current else {
            return Err(Error::MissingRange {
                start: from_lsn,
                end: to_lsn,
            }
            .into());
        };
        let mut last_in_run = block.is_last_in_run();
        reader.check_eof(last_in_run)?;
        if end_lsn < from_lsn {
            return Err(Error::MissingRange {
                start: end_lsn,
                end: from_lsn,
            }
            .into());
        }
        index.insert(block);

        while end_lsn < to_lsn || (end_lsn == to_lsn && !last_in_run) {
            while reader.at_eof() {
                reader.check_eof(last_in_run)?;
                i += 1;
                let prev_start = files[i - 1].as_ref().map(|f| f.start_lsn).unwrap_or(end_lsn);
                match files.get(i) {
                    None => {
                        return Err(Error::MissingRange {
                            start: end_lsn,
                            end: to_lsn,
                        }
                        .into());
                    }
                    Some(None) => {
                        warn!(seq_index = i, "changed page bitmap file missing from sequence");
                        return Err(Error::MissingRange {
                            start: prev_start,
                            end: to_lsn,
                        }
                        .into());
                    }
                    Some(Some(next)) => reader = BitmapFileReader::open(&next.path)?,
                }
            }

            let (block, ok) = reader.read_block()?;
            if !ok {
                return Err(
                    Error::corrupt(reader.path(), "changed page bitmap file corrupted").into(),
                );
            }
            end_lsn = block.end_lsn();
            last_in_run = block.is_last_in_run();
            index.insert(block);
        }

        info!(blocks = index.len(), end_lsn, "changed page index built");
        Ok(index)
    }

    /// Whether `page_id` of `space_id` changed in the indexed interval.
    pub fn has_changed(&self, space_id: u32, page_id: u32) -> bool {
        let Some((&(space, first), block)) = self.blocks.range(..=(space_id, page_id)).next_back()
        else {
            return false;
        };
        if space != space_id {
            return false;
        }
        let offset = (page_id - first) as usize;
        offset < PAGES_PER_BLOCK && block.bit(offset)
    }

    /// Iterator over the page ids of one space, starting at its first block.
    pub fn range(&self, space_id: u32) -> BitmapRange<'_> {
        let mut range = BitmapRange {
            iter: self.blocks.range((space_id, 0)..),
            space_id,
            block: None,
            bit_i: 0,
            current_page: 0,
        };
        range.setup_next_block();
        range
    }

    /// Like [`range`](Self::range) but positioned at `page_id`: inside the
    /// block covering it, or at the next block of the space if none does.
    pub fn range_from(&self, space_id: u32, page_id: u64) -> BitmapRange<'_> {
        let key_page = u32::try_from(page_id).unwrap_or(u32::MAX);
        if let Some((&(space, first), _)) = self.blocks.range(..=(space_id, key_page)).next_back()
        {
            if space == space_id && page_id < u64::from(first) + PAGES_PER_BLOCK as u64 {
                let mut range = BitmapRange {
                    iter: self.blocks.range((space, first)..),
                    space_id,
                    block: None,
                    bit_i: 0,
                    current_page: 0,
                };
                range.setup_next_block();
                range.bit_i = (page_id - u64::from(first)) as usize;
                range.current_page = page_id;
                return range;
            }
        }
        let mut range = BitmapRange {
            iter: self
                .blocks
                .range((Bound::Excluded((space_id, key_page)), Bound::Unbounded)),
            space_id,
            block: None,
            bit_i: 0,
            current_page: 0,
        };
        range.setup_next_block();
        range
    }
}

/// Ascending walk over page ids of one space with a given bit value.
/// Crossing into the next block jumps to that block's first page id.
#[derive(Debug)]
pub struct BitmapRange<'a> {
    iter: btree_map::Range<'a, (u32, u32), BitmapBlock>,
    space_id: u32,
    block: Option<&'a BitmapBlock>,
    bit_i: usize,
    current_page: u64,
}

impl<'a> BitmapRange<'a> {
    fn setup_next_block(&mut self) -> bool {
        match self.iter.next() {
            Some((&(space, first), block)) if space == self.space_id => {
                self.block = Some(block);
                self.current_page = u64::from(first);
                self.bit_i = 0;
                true
            }
            _ => {
                self.block = None;
                false
            }
        }
    }

    /// Next page id whose bit equals `value`, or `None` past the last block.
    pub fn next_bit(&mut self, value: bool) -> Option<u64> {
        loop {
            let block = self.block?;
            while self.bit_i < PAGES_PER_BLOCK {
                let hit = block.bit(self.bit_i) == value;
                let page = self.current_page;
                self.bit_i += 1;
                self.current_page += 1;
                if hit {
                    return Some(page);
                }
            }
            if !self.setup_next_block() {
                return None;
            }
        }
    }
}
