//! Destination abstraction for everything a backup writes.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{Error, Result};

/// A destination that backup files are written into, addressed by paths
/// relative to the backup root.
pub trait Datasink: Send + Sync {
    /// Create (or truncate) `rel_path`. `size_hint` is the source size when
    /// known.
    fn open(&self, rel_path: &Path, size_hint: Option<u64>) -> Result<Box<dyn DatasinkFile>>;

    fn remove(&self, rel_path: &Path) -> Result<()>;

    /// Create an empty directory placeholder.
    fn mkdir(&self, rel_path: &Path) -> Result<()>;
}

pub trait DatasinkFile: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// Write a whole file in one go.
pub fn write_file(sink: &dyn Datasink, rel_path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = sink.open(rel_path, Some(bytes.len() as u64))?;
    file.write(bytes)?;
    file.close()
}

/// Plain directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDatasink {
    root: PathBuf,
}

impl LocalDatasink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, rel_path: &Path) -> PathBuf {
        self.root.join(rel_path)
    }
}

impl Datasink for LocalDatasink {
    fn open(&self, rel_path: &Path, _size_hint: Option<u64>) -> Result<Box<dyn DatasinkFile>> {
        let path = self.full_path(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io_at(&path, e))?;
        Ok(Box::new(LocalFile {
            writer: BufWriter::with_capacity(1 << 20, file),
            path,
        }))
    }

    fn remove(&self, rel_path: &Path) -> Result<()> {
        let path = self.full_path(rel_path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_at(&path, e).into()),
        }
    }

    fn mkdir(&self, rel_path: &Path) -> Result<()> {
        let path = self.full_path(rel_path);
        fs::create_dir_all(&path).map_err(|e| Error::io_at(&path, e))?;
        Ok(())
    }
}

struct LocalFile {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl DatasinkFile for LocalFile {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| Error::io_at(&self.path, e))?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let path = self.path;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| Error::io_at(&path, e.into_error()))?;
        file.sync_data().map_err(|e| Error::io_at(&path, e))?;
        Ok(())
    }
}
