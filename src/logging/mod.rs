//! Logging initialization using `tracing` and `tracing-subscriber`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?} (expected human or json)")),
        }
    }
}

/// Aggregate state of the data file copy pool, sampled by the orchestrator
/// while workers are running and once more when they have all finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyProgressSnapshot {
    pub workers: usize,
    pub files_done: u64,
    pub files_failed: u64,
    pub bytes_read: u64,
    pub pages_written: u64,
    pub pages_skipped: u64,
    pub throttle_waits: u64,
}

/// Redo tailer position after one copy pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedoProgressSnapshot {
    pub scanned_lsn: u64,
    pub start_lsn: u64,
    pub bytes_copied: u64,
    pub passes: u64,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(format: LogFormat) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

/// Emit copy pool progress. `level_warn` is set for the final record of a
/// run that had failed workers.
pub fn log_copy_progress(snapshot: CopyProgressSnapshot, level_warn: bool) {
    if level_warn {
        warn!(
            target: "hotbackup::copy",
            workers = snapshot.workers,
            files_done = snapshot.files_done,
            files_failed = snapshot.files_failed,
            bytes_read = snapshot.bytes_read,
            pages_written = snapshot.pages_written,
            pages_skipped = snapshot.pages_skipped,
            throttle_waits = snapshot.throttle_waits,
            "copy_progress_failed"
        );
    } else {
        info!(
            target: "hotbackup::copy",
            workers = snapshot.workers,
            files_done = snapshot.files_done,
            files_failed = snapshot.files_failed,
            bytes_read = snapshot.bytes_read,
            pages_written = snapshot.pages_written,
            pages_skipped = snapshot.pages_skipped,
            throttle_waits = snapshot.throttle_waits,
            "copy_progress"
        );
    }
}

pub fn log_redo_progress(snapshot: RedoProgressSnapshot) {
    info!(
        target: "hotbackup::redo",
        scanned_lsn = snapshot.scanned_lsn,
        start_lsn = snapshot.start_lsn,
        bytes_copied = snapshot.bytes_copied,
        passes = snapshot.passes,
        "redo_progress"
    );
}
