//! Backup lifecycle: target directory, session, metadata records and the
//! chain of backups that `prepare` merges.

pub mod chain;
pub mod info;
pub mod metadata;
pub mod run;
pub mod session;
pub mod target;

pub use chain::{BackupChain, ChainElement, ChainIntegrity};
pub use info::BackupInfo;
pub use metadata::{BackupMetadata, BackupType, METADATA_FILE};
pub use run::{BackupReport, HotBackup};
pub use session::{BackupSession, LocalSession};
pub use target::{LockMarker, TargetDir, LOCK_FILE};
