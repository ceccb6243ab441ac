//! Delta file codec.
//!
//! A `.delta` file is a sequence of clusters. Each cluster starts with a
//! header page: a magic word followed by 4-byte page id slots. Page `i` of
//! the cluster is stored at `i * page_size` (the header is page 0), so a
//! cluster holds up to `page_size / 4 - 1` pages. A cluster that is not
//! full ends its slot list with [`SENTINEL_PAGE_ID`]. Only the last cluster
//! carries [`MAGIC_FINAL`].

use std::{
    ffi::OsString,
    fs::File,
    path::{Path, PathBuf},
};

use crate::{
    datasink::DatasinkFile,
    page::{be_u32, put_be_u32, read_full_at},
    Error, Result,
};

pub mod apply;

pub use apply::{ApplyStats, DeltaApplier};

/// "xtra": more clusters follow.
pub const MAGIC_IN_PROGRESS: u32 = 0x7874_7261;
/// "XTRA": last cluster of the file.
pub const MAGIC_FINAL: u32 = 0x5854_5241;
pub const SENTINEL_PAGE_ID: u32 = 0xFFFF_FFFF;

pub const DELTA_SUFFIX: &str = ".delta";
pub const META_SUFFIX: &str = ".meta";

/// Pages that fit in one cluster next to its header page.
pub fn cluster_capacity(page_size: usize) -> usize {
    page_size / 4 - 1
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn delta_path(rel_path: &Path) -> PathBuf {
    with_suffix(rel_path, DELTA_SUFFIX)
}

pub fn meta_path(rel_path: &Path) -> PathBuf {
    with_suffix(rel_path, META_SUFFIX)
}

/// `foo.ibd.delta` -> `foo.ibd`; `None` for anything else.
pub fn strip_delta_suffix(path: &Path) -> Option<PathBuf> {
    let s = path.to_str()?;
    s.strip_suffix(DELTA_SUFFIX).map(PathBuf::from)
}

/// Meta file of a delta file (`foo.ibd.delta` -> `foo.ibd.meta`).
pub fn meta_path_for_delta(delta: &Path) -> Option<PathBuf> {
    strip_delta_suffix(delta).map(|base| meta_path(&base))
}

/// Companion record of a `.delta` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaMeta {
    pub page_size: usize,
    /// Compressed page size, 0 when pages are not compressed.
    pub zip_size: usize,
    pub space_id: u32,
}

impl DeltaMeta {
    /// Page size of the pages stored in the delta.
    pub fn physical_page_size(&self) -> usize {
        if self.zip_size != 0 {
            self.zip_size
        } else {
            self.page_size
        }
    }

    pub fn to_text(&self) -> String {
        format!(
            "page_size = {}\nzip_size = {}\nspace_id = {}\n",
            self.page_size, self.zip_size, self.space_id
        )
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidMetadata {
            path: path.display().to_string(),
            reason,
        };
        let mut page_size = None;
        let mut zip_size = 0;
        let mut space_id = None;
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "page_size" => {
                    page_size = Some(value.parse().map_err(|_| {
                        invalid(format!("bad page_size value {value:?}"))
                    })?)
                }
                "zip_size" => {
                    zip_size = value
                        .parse()
                        .map_err(|_| invalid(format!("bad zip_size value {value:?}")))?
                }
                "space_id" => {
                    space_id = Some(value.parse().map_err(|_| {
                        invalid(format!("bad space_id value {value:?}"))
                    })?)
                }
                _ => {}
            }
        }
        let page_size: usize = page_size.ok_or_else(|| invalid("page_size missing".into()))?;
        let space_id = space_id.ok_or_else(|| invalid("space_id missing".into()))?;
        if !page_size.is_power_of_two() || page_size < 1024 {
            return Err(invalid(format!("unsupported page size {page_size}")).into());
        }
        Ok(Self {
            page_size,
            zip_size,
            space_id,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io_at(path, e))?;
        Self::parse(&text, path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaSummary {
    pub clusters: u64,
    pub pages: u64,
}

/// Packs pages into clusters and streams them to a datasink file.
pub struct DeltaWriter {
    out: Box<dyn DatasinkFile>,
    page_size: usize,
    cluster: Vec<u8>,
    npages: usize,
    summary: DeltaSummary,
}

impl DeltaWriter {
    pub fn new(out: Box<dyn DatasinkFile>, page_size: usize) -> Self {
        let capacity = cluster_capacity(page_size);
        Self {
            out,
            page_size,
            cluster: vec![0u8; (capacity + 1) * page_size],
            npages: 0,
            summary: DeltaSummary::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        cluster_capacity(self.page_size)
    }

    /// Add a page. A full cluster is only flushed when another page comes
    /// in, so the last cluster can still be marked final.
    pub fn push(&mut self, page_no: u32, page: &[u8]) -> Result<()> {
        if self.npages == self.capacity() {
            self.flush(MAGIC_IN_PROGRESS)?;
        }
        let slot = self.npages + 1;
        put_be_u32(&mut self.cluster, slot * 4, page_no);
        let start = slot * self.page_size;
        self.cluster[start..start + self.page_size].copy_from_slice(&page[..self.page_size]);
        self.npages += 1;
        self.summary.pages += 1;
        Ok(())
    }

    fn flush(&mut self, magic: u32) -> Result<()> {
        put_be_u32(&mut self.cluster, 0, magic);
        let len = (self.npages + 1) * self.page_size;
        self.out.write(&self.cluster[..len])?;
        self.cluster[..self.page_size].fill(0);
        self.npages = 0;
        self.summary.clusters += 1;
        Ok(())
    }

    /// Write the final cluster (possibly just a header) and close the file.
    pub fn finish(mut self) -> Result<DeltaSummary> {
        if self.npages < self.capacity() {
            put_be_u32(&mut self.cluster, (self.npages + 1) * 4, SENTINEL_PAGE_ID);
        }
        self.flush(MAGIC_FINAL)?;
        let summary = self.summary;
        self.out.close()?;
        Ok(summary)
    }
}

/// One decoded cluster.
#[derive(Debug)]
pub struct DeltaCluster {
    pub page_ids: Vec<u32>,
    pub is_final: bool,
    data: Vec<u8>,
    page_size: usize,
}

impl DeltaCluster {
    pub fn page(&self, idx: usize) -> &[u8] {
        let start = idx * self.page_size;
        &self.data[start..start + self.page_size]
    }

    pub fn pages(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.page_ids
            .iter()
            .copied()
            .zip(self.data.chunks_exact(self.page_size))
    }
}

/// Sequential cluster reader over a `.delta` file.
#[derive(Debug)]
pub struct DeltaReader {
    file: File,
    path: PathBuf,
    page_size: usize,
    offset: u64,
    finished: bool,
}

impl DeltaReader {
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            offset: 0,
            finished: false,
        })
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidDelta {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn next_cluster(&mut self) -> Result<Option<DeltaCluster>> {
        if self.finished {
            return Ok(None);
        }
        let ps = self.page_size;
        let mut header = vec![0u8; ps];
        let n = read_full_at(&self.file, &mut header, self.offset)
            .map_err(|e| Error::io_at(&self.path, e))?;
        if n != ps {
            return Err(self
                .invalid(format!("truncated cluster header at offset {}", self.offset))
                .into());
        }

        let is_final = match be_u32(&header, 0) {
            MAGIC_FINAL => true,
            MAGIC_IN_PROGRESS => false,
            other => {
                return Err(self.invalid(format!("bad cluster magic {other:#010x}")).into());
            }
        };

        let capacity = cluster_capacity(ps);
        let page_ids: Vec<u32> = (1..=capacity)
            .map(|slot| be_u32(&header, slot * 4))
            .take_while(|&id| id != SENTINEL_PAGE_ID)
            .collect();
        if !is_final && page_ids.len() != capacity {
            return Err(self
                .invalid("partial cluster is not the last one in the file")
                .into());
        }

        let mut data = vec![0u8; page_ids.len() * ps];
        let n = read_full_at(&self.file, &mut data, self.offset + ps as u64)
            .map_err(|e| Error::io_at(&self.path, e))?;
        if n != data.len() {
            return Err(self.invalid("truncated cluster pages").into());
        }

        self.offset += ((page_ids.len() + 1) * ps) as u64;
        self.finished = is_final;
        Ok(Some(DeltaCluster {
            page_ids,
            is_final,
            data,
            page_size: ps,
        }))
    }
}
