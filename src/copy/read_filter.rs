//! Read filters decide which byte ranges of a tablespace are read at all.

use crate::bitmap::ChangedPageIndex;

use super::cursor::FileCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    pub offset: u64,
    pub len: usize,
}

/// Produces the sequence of ranges to read from one file. `State` is the
/// per-file position, owned by the worker copying that file.
pub trait ReadFilter: Sync {
    type State;

    fn init(&self, cursor: &FileCursor) -> Self::State;

    /// Next range to read, or `None` once the file is exhausted.
    fn next_range(&self, state: &mut Self::State, cursor: &FileCursor) -> Option<ReadRange>;
}

/// Reads the whole file front to back.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl ReadFilter for PassThrough {
    type State = u64;

    fn init(&self, _cursor: &FileCursor) -> u64 {
        0
    }

    fn next_range(&self, offset: &mut u64, cursor: &FileCursor) -> Option<ReadRange> {
        if *offset >= cursor.size() {
            return None;
        }
        let remaining = cursor.size() - *offset;
        let len = remaining.min(cursor.capacity() as u64) as usize;
        let range = ReadRange {
            offset: *offset,
            len,
        };
        *offset += len as u64;
        Some(range)
    }
}

/// Reads only runs of pages marked changed in the index.
#[derive(Debug, Clone, Copy)]
pub struct BitmapFiltered<'a> {
    index: &'a ChangedPageIndex,
}

impl<'a> BitmapFiltered<'a> {
    pub fn new(index: &'a ChangedPageIndex) -> Self {
        Self { index }
    }
}

#[derive(Debug, Clone)]
pub struct BitmapState {
    offset: u64,
    /// First page after the current run; `None` runs to end of file.
    batch_end: Option<u64>,
    search_from: u64,
    done: bool,
}

impl ReadFilter for BitmapFiltered<'_> {
    type State = BitmapState;

    fn init(&self, _cursor: &FileCursor) -> BitmapState {
        BitmapState {
            offset: 0,
            batch_end: Some(0),
            search_from: 0,
            done: false,
        }
    }

    fn next_range(&self, state: &mut BitmapState, cursor: &FileCursor) -> Option<ReadRange> {
        if state.done {
            return None;
        }
        let ps = cursor.physical_page_size() as u64;

        if state.batch_end == Some(state.offset / ps) {
            let mut range = self.index.range_from(cursor.space_id(), state.search_from);
            let Some(start) = range.next_bit(true) else {
                state.done = true;
                return None;
            };
            let end = range.next_bit(false);
            state.search_from = end.map_or(u64::MAX, |e| e + 1);
            state.offset = start * ps;
            state.batch_end = end;
        }

        if state.offset >= cursor.size() {
            state.done = true;
            return None;
        }

        let len = match state.batch_end {
            Some(end) => end * ps - state.offset,
            None => cursor.size() - state.offset,
        };
        let len = len.min(cursor.capacity() as u64) as usize;
        let range = ReadRange {
            offset: state.offset,
            len,
        };
        state.offset += len as u64;
        Some(range)
    }
}
