//! Shared cursor over the files of a data directory.

use std::{
    io,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    EmptyDir,
}

/// One file or empty directory, owned by the worker that dequeued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatadirEntry {
    pub path: PathBuf,
    pub rel_path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
}

impl DatadirEntry {
    /// Database directory for entries one level below the root.
    pub fn database(&self) -> Option<&str> {
        let mut parts = self.rel_path.components();
        let first = parts.next()?;
        parts.next()?;
        first.as_os_str().to_str()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.rel_path.file_name().and_then(|n| n.to_str())
    }
}

/// Hands out entries one at a time to any number of threads. Only entries
/// accepted by `select` are returned.
pub struct DatadirIterator<'a> {
    root: PathBuf,
    walker: Mutex<walkdir::IntoIter>,
    select: &'a (dyn Fn(&DatadirEntry) -> bool + Sync),
}

impl std::fmt::Debug for DatadirIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatadirIterator")
            .field("root", &self.root)
            .finish()
    }
}

impl<'a> DatadirIterator<'a> {
    pub fn new(root: &Path, select: &'a (dyn Fn(&DatadirEntry) -> bool + Sync)) -> Self {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Self {
            root: root.to_path_buf(),
            walker: Mutex::new(walker),
            select,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Next selected entry, `None` when the walk is over.
    pub fn next_entry(&self) -> Result<Option<DatadirEntry>> {
        let mut walker = self.walker.lock();
        loop {
            let Some(item) = walker.next() else {
                return Ok(None);
            };
            let entry = item.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                Error::io_at(path, io::Error::from(e))
            })?;
            if entry.depth() == 0 {
                continue;
            }
            let rel_path = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_path_buf();
            let file_type = entry.file_type();

            let candidate = if file_type.is_dir() {
                if !dir_is_empty(entry.path())? {
                    continue;
                }
                DatadirEntry {
                    path: entry.path().to_path_buf(),
                    rel_path,
                    kind: EntryKind::EmptyDir,
                    size: 0,
                }
            } else if file_type.is_file() {
                let size = entry
                    .metadata()
                    .map_err(|e| Error::io_at(entry.path(), io::Error::from(e)))?
                    .len();
                DatadirEntry {
                    path: entry.path().to_path_buf(),
                    rel_path,
                    kind: EntryKind::File,
                    size,
                }
            } else {
                continue;
            };

            if (self.select)(&candidate) {
                return Ok(Some(candidate));
            }
        }
    }
}

fn dir_is_empty(path: &Path) -> Result<bool> {
    let mut entries = std::fs::read_dir(path).map_err(|e| Error::io_at(path, e))?;
    Ok(entries.next().is_none())
}
