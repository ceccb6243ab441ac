//! Tablespace page layout, checksums and page-indexed I/O buffers.
//!
//! Integers inside pages are stored big-endian. A page is trusted when it is
//! all zeroes or when either the plain or the full-crc32 checksum validates.

use std::{fs::File, io, os::unix::fs::FileExt};

use crate::{Error, Result};

/// Default logical page size (flags `page_ssize == 0`).
pub const DEFAULT_PAGE_SIZE: usize = 16384;
pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_PAGE_SIZE: usize = 65536;

pub const FIL_PAGE_CHECKSUM: usize = 0;
pub const FIL_PAGE_OFFSET: usize = 4;
pub const FIL_PAGE_LSN: usize = 16;
pub const FIL_PAGE_TYPE: usize = 24;
pub const FIL_PAGE_SPACE_ID: usize = 34;
pub const FIL_PAGE_DATA: usize = 38;
/// Trailer size: low 32 bits of the page LSN followed by the full-crc32 value.
pub const FIL_PAGE_TRAILER: usize = 8;

pub const FSP_HEADER_OFFSET: usize = FIL_PAGE_DATA;
pub const FSP_SPACE_ID: usize = FSP_HEADER_OFFSET;
pub const FSP_SIZE: usize = FSP_HEADER_OFFSET + 8;
pub const FSP_SPACE_FLAGS: usize = FSP_HEADER_OFFSET + 16;

/// Double-write buffer reserved in the system tablespace (space 0).
pub const DOUBLEWRITE_FIRST_PAGE: u32 = 64;
pub const DOUBLEWRITE_PAGES: u32 = 128;

/// Pages in a cursor buffer.
pub const BUFFER_PAGES: usize = 640;

pub fn be_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

pub fn be_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub fn be_u64(buf: &[u8], off: usize) -> u64 {
    (u64::from(be_u32(buf, off)) << 32) | u64::from(be_u32(buf, off + 4))
}

pub fn put_be_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn put_be_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn put_be_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_be_bytes());
}

pub fn page_no(page: &[u8]) -> u32 {
    be_u32(page, FIL_PAGE_OFFSET)
}

pub fn page_lsn(page: &[u8]) -> u64 {
    be_u64(page, FIL_PAGE_LSN)
}

pub fn page_space_id(page: &[u8]) -> u32 {
    be_u32(page, FIL_PAGE_SPACE_ID)
}

pub fn is_all_zero(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

fn plain_checksum(page: &[u8]) -> u32 {
    crc32c::crc32c(&page[FIL_PAGE_OFFSET..page.len() - FIL_PAGE_TRAILER])
}

fn full_crc32(page: &[u8]) -> u32 {
    crc32c::crc32c(&page[..page.len() - 4])
}

/// Plain checksum: header checksum field plus the trailer LSN copy.
pub fn plain_checksum_ok(page: &[u8]) -> bool {
    let n = page.len();
    be_u32(page, FIL_PAGE_CHECKSUM) == plain_checksum(page)
        && be_u32(page, n - FIL_PAGE_TRAILER) == page_lsn(page) as u32
}

/// Full-crc32 checksum in the last four bytes, maintained for encrypted
/// pages whose header checksum field is not.
pub fn crypt_checksum_ok(page: &[u8]) -> bool {
    let n = page.len();
    be_u32(page, n - 4) == full_crc32(page)
}

/// Whether a page read from disk can be trusted.
pub fn is_page_valid(page: &[u8]) -> bool {
    if page.len() < FIL_PAGE_DATA + FIL_PAGE_TRAILER {
        return false;
    }
    is_all_zero(page) || plain_checksum_ok(page) || crypt_checksum_ok(page)
}

/// Stamp both checksums and the trailer LSN into a page image.
pub fn stamp_checksums(page: &mut [u8]) {
    let n = page.len();
    let lsn_low = page_lsn(page) as u32;
    put_be_u32(page, n - FIL_PAGE_TRAILER, lsn_low);
    let plain = plain_checksum(page);
    put_be_u32(page, FIL_PAGE_CHECKSUM, plain);
    let full = full_crc32(page);
    put_be_u32(page, n - 4, full);
}

/// Whether `page_no` of `space_id` lies in the double-write reserved area,
/// which is rewritten in place during normal operation and may be torn.
pub fn in_doublewrite_area(space_id: u32, page_no: u64) -> bool {
    space_id == 0
        && page_no >= u64::from(DOUBLEWRITE_FIRST_PAGE)
        && page_no < u64::from(DOUBLEWRITE_FIRST_PAGE + DOUBLEWRITE_PAGES)
}

/// Logical and physical page size of a tablespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize {
    pub logical: usize,
    /// Compressed page size, 0 when pages are not compressed.
    pub zip: usize,
}

impl PageSize {
    pub fn uncompressed(logical: usize) -> Self {
        Self { logical, zip: 0 }
    }

    /// Size of a page as stored in the file.
    pub fn physical(&self) -> usize {
        if self.zip != 0 {
            self.zip
        } else {
            self.logical
        }
    }

    pub fn from_fsp_flags(flags: u32) -> Option<Self> {
        let ssize = flags & 0xF;
        let zip_ssize = (flags >> 4) & 0xF;
        let logical = match ssize {
            0 => DEFAULT_PAGE_SIZE,
            3..=7 => 512usize << ssize,
            _ => return None,
        };
        let zip = match zip_ssize {
            0 => 0,
            1..=5 => 512usize << zip_ssize,
            _ => return None,
        };
        if zip > logical {
            return None;
        }
        Some(Self { logical, zip })
    }

    pub fn to_fsp_flags(&self) -> u32 {
        let ssize = if self.logical == DEFAULT_PAGE_SIZE {
            0
        } else {
            self.logical.trailing_zeros() - 9
        };
        let zip_ssize = if self.zip == 0 {
            0
        } else {
            self.zip.trailing_zeros() - 9
        };
        ssize | (zip_ssize << 4)
    }
}

/// File-space header stored on page 0 of every tablespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FspHeader {
    pub space_id: u32,
    /// Tablespace size in pages.
    pub size: u32,
    pub flags: u32,
}

impl FspHeader {
    pub fn parse(page0: &[u8]) -> Self {
        Self {
            space_id: be_u32(page0, FSP_SPACE_ID),
            size: be_u32(page0, FSP_SIZE),
            flags: be_u32(page0, FSP_SPACE_FLAGS),
        }
    }

    pub fn write(&self, page0: &mut [u8]) {
        put_be_u32(page0, FSP_SPACE_ID, self.space_id);
        put_be_u32(page0, FSP_SIZE, self.size);
        put_be_u32(page0, FSP_SPACE_FLAGS, self.flags);
    }
}

/// Read the FSP header of a tablespace file and work out its page geometry.
/// Files shorter than one minimal page fall back to the default page size.
pub fn probe_tablespace(file: &File, path: &std::path::Path) -> Result<(FspHeader, PageSize)> {
    let mut head = vec![0u8; MIN_PAGE_SIZE];
    let n = read_full_at(file, &mut head, 0).map_err(|e| Error::io_at(path, e))?;
    if n < FSP_SPACE_FLAGS + 4 {
        let header = FspHeader {
            space_id: 0,
            size: 0,
            flags: 0,
        };
        return Ok((header, PageSize::uncompressed(DEFAULT_PAGE_SIZE)));
    }
    let header = FspHeader::parse(&head);
    let size = PageSize::from_fsp_flags(header.flags).ok_or_else(|| {
        Error::corrupt(path, format!("invalid tablespace flags {:#x}", header.flags))
    })?;
    Ok((header, size))
}

/// Positional read that keeps going until `buf` is full or EOF is hit.
pub fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Fixed-capacity read buffer addressed by page index.
#[derive(Debug)]
pub struct PageBuffer {
    data: Vec<u8>,
    page_size: usize,
    len: usize,
}

impl PageBuffer {
    pub fn new(page_size: usize, pages: usize) -> Self {
        Self {
            data: vec![0u8; page_size * pages],
            page_size,
            len: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes filled by the last read.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whole pages filled by the last read.
    pub fn page_count(&self) -> usize {
        self.len / self.page_size
    }

    pub fn page(&self, idx: usize) -> &[u8] {
        let start = idx * self.page_size;
        &self.data[start..start + self.page_size]
    }

    pub fn pages(&self) -> impl Iterator<Item = &[u8]> {
        self.data[..self.page_count() * self.page_size].chunks_exact(self.page_size)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Fill the buffer from `file` at `offset`; `len` is capped by capacity.
    pub fn fill(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        let want = len.min(self.data.len());
        let n = read_full_at(file, &mut self.data[..want], offset)?;
        self.len = n;
        Ok(n)
    }
}
