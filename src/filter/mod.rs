//! Skip predicate for partial backups.

use std::{collections::HashSet, path::Path};

use regex::Regex;

use crate::{config::TableFilterConfig, Error, Result};

/// Decides which files of a data directory a partial backup leaves out.
/// Files directly under the data directory root are never skipped.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    databases: Option<HashSet<String>>,
    databases_exclude: HashSet<String>,
    tables: Vec<Regex>,
    tables_exclude: Vec<Regex>,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| Error::InvalidFilter(format!("{p}: {e}")).into()))
        .collect()
}

impl TableFilter {
    /// Filter that keeps everything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &TableFilterConfig) -> Result<Self> {
        for name in cfg.databases.iter().chain(&cfg.databases_exclude) {
            if name.is_empty() || name.contains('/') {
                return Err(Error::InvalidFilter(format!("bad database name {name:?}")).into());
            }
        }
        Ok(Self {
            databases: (!cfg.databases.is_empty())
                .then(|| cfg.databases.iter().cloned().collect()),
            databases_exclude: cfg.databases_exclude.iter().cloned().collect(),
            tables: compile(&cfg.tables)?,
            tables_exclude: compile(&cfg.tables_exclude)?,
        })
    }

    /// Whether this filter can leave anything out.
    pub fn is_active(&self) -> bool {
        self.databases.is_some()
            || !self.databases_exclude.is_empty()
            || !self.tables.is_empty()
            || !self.tables_exclude.is_empty()
    }

    pub fn skips_database(&self, db: &str) -> bool {
        if self.databases_exclude.contains(db) {
            return true;
        }
        self.databases.as_ref().is_some_and(|dbs| !dbs.contains(db))
    }

    pub fn skips_table(&self, db: &str, table: &str) -> bool {
        if self.skips_database(db) {
            return true;
        }
        let name = format!("{db}.{table}");
        if self.tables_exclude.iter().any(|re| re.is_match(&name)) {
            return true;
        }
        !self.tables.is_empty() && !self.tables.iter().any(|re| re.is_match(&name))
    }

    /// Skip decision for a file or directory relative to the data directory.
    pub fn skips(&self, rel_path: &Path) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut parts = rel_path.components();
        let Some(db) = parts.next().and_then(|c| c.as_os_str().to_str()) else {
            return false;
        };
        if parts.next().is_none() {
            return false;
        }
        let Some(stem) = rel_path.file_stem().and_then(|s| s.to_str()) else {
            return self.skips_database(db);
        };
        // Partitions and temporary copies share the table's name up to '#'.
        let table = stem.split('#').next().unwrap_or(stem);
        self.skips_table(db, table)
    }
}
