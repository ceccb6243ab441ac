//! Replays `.delta` files onto tablespace files of a prepared backup.

use std::{
    fs::{self, File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::{meta_path_for_delta, DeltaMeta, DeltaReader};
use crate::{
    page::{self, FspHeader},
    Error, Result,
};

/// Size, in pages, a tablespace created from scratch is given.
pub const MIN_TABLESPACE_PAGES: u64 = 4;

pub const QUARANTINE_PREFIX: &str = "hotbackup_tmp_#";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub deltas: u64,
    pub clusters: u64,
    pub pages: u64,
}

/// Applies deltas below `target_root`, where other tablespaces may be
/// looked up by space id when a table was renamed between backups.
#[derive(Debug, Clone)]
pub struct DeltaApplier {
    target_root: PathBuf,
}

impl DeltaApplier {
    pub fn new(target_root: impl Into<PathBuf>) -> Self {
        Self {
            target_root: target_root.into(),
        }
    }

    /// Apply `delta_chain` (oldest first) to `base_path`.
    #[instrument(skip(self, delta_chain), fields(base = %base_path.display(), deltas = delta_chain.len()))]
    pub fn apply(&self, base_path: &Path, delta_chain: &[PathBuf]) -> Result<ApplyStats> {
        let mut stats = ApplyStats::default();
        for delta in delta_chain {
            let meta_file = meta_path_for_delta(delta).ok_or_else(|| Error::InvalidDelta {
                path: delta.display().to_string(),
                reason: "file name does not end in .delta".into(),
            })?;
            let meta = DeltaMeta::load(&meta_file)?;
            let file = self.open_matching(base_path, &meta)?;
            self.apply_one(&file, base_path, delta, &meta, &mut stats)?;
            file.sync_all().map_err(|e| Error::io_at(base_path, e))?;
            stats.deltas += 1;
        }
        debug!(pages = stats.pages, clusters = stats.clusters, "deltas applied");
        Ok(stats)
    }

    fn apply_one(
        &self,
        file: &File,
        base_path: &Path,
        delta: &Path,
        meta: &DeltaMeta,
        stats: &mut ApplyStats,
    ) -> Result<()> {
        let ps = meta.physical_page_size();
        let mut reader = DeltaReader::open(delta, ps)?;
        while let Some(cluster) = reader.next_cluster()? {
            for (page_no, page) in cluster.pages() {
                if page_no == 0 && page::page_space_id(page) != 0 {
                    let header = FspHeader::parse(page);
                    let want = u64::from(header.size) * ps as u64;
                    let have = file.metadata().map_err(|e| Error::io_at(base_path, e))?.len();
                    if want != have {
                        debug!(from = have, to = want, "resizing tablespace to its header size");
                        file.set_len(want).map_err(|e| Error::io_at(base_path, e))?;
                    }
                }
                file.write_all_at(page, u64::from(page_no) * ps as u64)
                    .map_err(|e| Error::io_at(base_path, e))?;
                stats.pages += 1;
            }
            stats.clusters += 1;
        }
        Ok(())
    }

    /// Open the file at `dest` holding `meta.space_id`, moving things around
    /// when the name and the space id disagree.
    fn open_matching(&self, dest: &Path, meta: &DeltaMeta) -> Result<File> {
        let ps = meta.physical_page_size() as u64;
        let is_single_table = dest.extension().is_some_and(|ext| ext == "ibd");

        if is_single_table && meta.space_id != 0 {
            if dest.exists() {
                match read_space_id(dest)? {
                    Some(id) if id != meta.space_id => {
                        let quarantine = quarantine_path(dest, id);
                        warn!(
                            path = %dest.display(),
                            found_space_id = id,
                            expected_space_id = meta.space_id,
                            quarantine = %quarantine.display(),
                            "tablespace id mismatch, moving existing file aside"
                        );
                        fs::rename(dest, &quarantine).map_err(|e| Error::io_at(dest, e))?;
                    }
                    _ => {}
                }
            }
            if !dest.exists() {
                if let Some(found) = find_tablespace(&self.target_root, meta.space_id, dest)? {
                    info!(
                        from = %found.display(),
                        to = %dest.display(),
                        space_id = meta.space_id,
                        "renaming tablespace to match delta"
                    );
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
                    }
                    fs::rename(&found, dest).map_err(|e| Error::io_at(&found, e))?;
                }
            }
        }

        if !dest.exists() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(dest)
                .map_err(|e| Error::io_at(dest, e))?;
            file.set_len(MIN_TABLESPACE_PAGES * ps)
                .map_err(|e| Error::io_at(dest, e))?;
            info!(path = %dest.display(), space_id = meta.space_id, "created tablespace for delta");
            return Ok(file);
        }

        OpenOptions::new()
            .read(true)
            .write(true)
            .open(dest)
            .map_err(|e| Error::io_at(dest, e).into())
    }
}

fn quarantine_path(dest: &Path, space_id: u32) -> PathBuf {
    let name = format!("{QUARANTINE_PREFIX}{space_id}.ibd");
    match dest.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

pub fn is_quarantine_name(name: &str) -> bool {
    name.starts_with(QUARANTINE_PREFIX)
}

/// Space id from a tablespace's first page; `None` if the file is too short.
pub fn read_space_id(path: &Path) -> Result<Option<u32>> {
    let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
    let mut head = [0u8; page::FSP_SPACE_FLAGS + 4];
    let n = page::read_full_at(&file, &mut head, 0).map_err(|e| Error::io_at(path, e))?;
    if n < head.len() {
        return Ok(None);
    }
    Ok(Some(FspHeader::parse(&head).space_id))
}

fn find_tablespace(root: &Path, space_id: u32, skip: &Path) -> Result<Option<PathBuf>> {
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || path == skip {
            continue;
        }
        if path.extension().map_or(true, |ext| ext != "ibd") {
            continue;
        }
        if read_space_id(path)? == Some(space_id) {
            return Ok(Some(path.to_path_buf()));
        }
    }
    Ok(None)
}
