//! Sequential page reader over one tablespace file.

use std::{
    fs::File,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    page::{self, FspHeader, PageBuffer, PageSize, BUFFER_PAGES},
    Error, Result,
};

/// Reads of a batch with a bad page are repeated this many times.
pub const CORRUPT_READ_RETRIES: u32 = 10;
pub const CORRUPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct FileCursor {
    file: File,
    path: PathBuf,
    rel_path: PathBuf,
    size: u64,
    header: FspHeader,
    page_size: PageSize,
    buf: PageBuffer,
    buf_page_no: u64,
    next_offset: u64,
    thread: usize,
    retry_delay: Duration,
}

impl FileCursor {
    pub fn open(path: &Path, rel_path: &Path, thread: usize) -> Result<Self> {
        Self::with_buffer_pages(path, rel_path, thread, BUFFER_PAGES)
    }

    pub fn with_buffer_pages(
        path: &Path,
        rel_path: &Path,
        thread: usize,
        pages: usize,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
        let size = file.metadata().map_err(|e| Error::io_at(path, e))?.len();
        let (header, page_size) = page::probe_tablespace(&file, path)?;
        let buf = PageBuffer::new(page_size.physical(), pages.max(1));
        advise(&file, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
        debug!(
            thread,
            path = %path.display(),
            size,
            space_id = header.space_id,
            page_size = page_size.physical(),
            "opened tablespace"
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            rel_path: rel_path.to_path_buf(),
            size,
            header,
            page_size,
            buf,
            buf_page_no: 0,
            next_offset: 0,
            thread,
            retry_delay: CORRUPT_RETRY_DELAY,
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rel_path(&self) -> &Path {
        &self.rel_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn space_id(&self) -> u32 {
        self.header.space_id
    }

    pub fn header(&self) -> &FspHeader {
        &self.header
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Size of a page as stored in this file.
    pub fn physical_page_size(&self) -> usize {
        self.page_size.physical()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn thread(&self) -> usize {
        self.thread
    }

    /// Offset right after the last batch.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Page number of the first page in the current batch.
    pub fn batch_first_page(&self) -> u64 {
        self.buf_page_no
    }

    pub fn buffer(&self) -> &PageBuffer {
        &self.buf
    }

    /// Read `len` bytes at `offset` into the buffer and validate every page.
    /// Returns `false` when nothing could be read.
    pub fn read_range(&mut self, offset: u64, len: usize) -> Result<bool> {
        let ps = self.physical_page_size();
        let want = len.min(self.buf.capacity());
        let want = want - want % ps;
        if want == 0 || offset >= self.size {
            return Ok(false);
        }
        let first_page = offset / ps as u64;

        let mut attempts_left = CORRUPT_READ_RETRIES;
        loop {
            let n = self
                .buf
                .fill(&self.file, offset, want)
                .map_err(|e| Error::io_at(&self.path, e))?;
            if n < ps {
                return Ok(false);
            }

            match self.first_corrupt_page(first_page) {
                None => {
                    advise(&self.file, offset, n, libc::POSIX_FADV_DONTNEED);
                    self.buf_page_no = first_page;
                    self.next_offset = offset + n as u64;
                    return Ok(true);
                }
                Some(page_no) => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(Error::corrupt(
                            &self.path,
                            format!(
                                "page {page_no} failed checksum after {CORRUPT_READ_RETRIES} reads"
                            ),
                        )
                        .into());
                    }
                    warn!(
                        thread = self.thread,
                        path = %self.path.display(),
                        page_no,
                        attempts_left,
                        "database page corruption detected, retrying"
                    );
                    std::thread::sleep(self.retry_delay);
                }
            }
        }
    }

    fn first_corrupt_page(&self, first_page: u64) -> Option<u64> {
        let space_id = self.header.space_id;
        for (i, page) in self.buf.pages().enumerate() {
            let page_no = first_page + i as u64;
            if page::is_page_valid(page) {
                continue;
            }
            if page::in_doublewrite_area(space_id, page_no) {
                warn!(
                    thread = self.thread,
                    path = %self.path.display(),
                    page_no,
                    "ignoring corrupted page in double-write buffer"
                );
                continue;
            }
            return Some(page_no);
        }
        None
    }
}

fn advise(file: &File, offset: u64, len: usize, advice: libc::c_int) {
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            len as libc::off_t,
            advice,
        );
    }
}
