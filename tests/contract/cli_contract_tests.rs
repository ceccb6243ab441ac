//! CLI contract tests for hotbackup argument validation.

use std::fs;

use hotbackup::{
    backup::{BackupMetadata, BackupType},
    cli::{self, backup::BackupArgs},
    Error,
};
use tempfile::tempdir;

#[path = "../common/mod.rs"]
mod common;

fn expect_error(args: &[&str], expected: Error) {
    let err = hotbackup::run(args.iter().copied()).expect_err("command should fail");
    let actual = err
        .downcast_ref::<Error>()
        .unwrap_or_else(|| panic!("unexpected error type: {err:?}"));
    match expected {
        Error::Cli(ref expected_msg) => {
            assert!(
                matches!(actual, Error::Cli(msg) if msg == expected_msg),
                "got {actual:?}"
            );
        }
        _ => {
            assert_eq!(
                std::mem::discriminant(actual),
                std::mem::discriminant(&expected),
                "got {actual:?}"
            );
        }
    }
}

#[test]
fn backup_requires_datadir_and_target() {
    expect_error(
        &["hotbackup", "backup"],
        Error::Cli("datadir is required".into()),
    );
    expect_error(
        &["hotbackup", "backup", "--datadir", "/var/lib/db"],
        Error::Cli("target_dir is required".into()),
    );
    expect_error(
        &[
            "hotbackup",
            "backup",
            "--datadir",
            "/var/lib/db",
            "--target-dir",
            "/backups/x",
            "--parallel",
            "0",
        ],
        Error::Cli("parallel must be at least 1".into()),
    );
}

#[test]
fn backup_rejects_missing_datadir() {
    let target = tempdir().unwrap();
    let err = hotbackup::run([
        "hotbackup",
        "backup",
        "--datadir",
        "/no/such/datadir",
        "--target-dir",
        target.path().join("bk").to_str().unwrap(),
    ])
    .expect_err("missing datadir must fail");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Cli(_))));
}

#[test]
fn backup_refuses_non_empty_target() {
    let datadir = tempdir().unwrap();
    let target = tempdir().unwrap();
    fs::write(target.path().join("keep.txt"), b"occupied").unwrap();

    let err = hotbackup::run([
        "hotbackup",
        "backup",
        "--datadir",
        datadir.path().to_str().unwrap(),
        "--target-dir",
        target.path().to_str().unwrap(),
    ])
    .expect_err("non-empty target must fail");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::TargetNotEmpty(_))
    ));
    assert!(!target.path().join(hotbackup::backup::LOCK_FILE).exists());
}

#[test]
fn backup_rejects_bad_table_pattern() {
    let datadir = tempdir().unwrap();
    let target = tempdir().unwrap();
    expect_error(
        &[
            "hotbackup",
            "backup",
            "--datadir",
            datadir.path().to_str().unwrap(),
            "--target-dir",
            target.path().join("bk").to_str().unwrap(),
            "--tables",
            "db1.(t1",
        ],
        Error::InvalidFilter(String::new()),
    );
}

#[test]
fn prepare_requires_existing_target() {
    expect_error(
        &["hotbackup", "prepare"],
        Error::Cli("target_dir is required".into()),
    );
    expect_error(
        &["hotbackup", "prepare", "--target-dir", "/no/such/backup"],
        Error::InvalidTargetDir(String::new()),
    );
}

#[test]
fn copy_back_requires_backup_and_datadir() {
    expect_error(
        &["hotbackup", "copy-back"],
        Error::Cli("target_dir is required".into()),
    );
    expect_error(
        &["hotbackup", "copy-back", "--target-dir", "/backups/full"],
        Error::Cli("datadir is required".into()),
    );
    expect_error(
        &[
            "hotbackup",
            "copy-back",
            "--target-dir",
            "/no/such/backup",
            "--datadir",
            "/var/lib/db",
        ],
        Error::InvalidTargetDir(String::new()),
    );
}

#[test]
fn flags_override_config_file() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    let config_path = dir.path().join("backup.json");
    fs::write(
        &config_path,
        r#"{
            "datadir": "/var/lib/db",
            "target_dir": "/backups/full",
            "incremental_lsn": 5000,
            "parallel": 4,
            "filters": { "databases": ["sales"] }
        }"#,
    )?;

    let config = cli::backup::resolve_config(BackupArgs {
        config: Some(config_path),
        target_dir: Some("/backups/inc".into()),
        incremental_basedir: Some("/backups/full".into()),
        parallel: Some(2),
        no_bitmaps: true,
        databases: vec!["hr".into()],
        ..BackupArgs::default()
    })?;

    assert_eq!(config.datadir, std::path::Path::new("/var/lib/db"));
    assert_eq!(config.target_dir, std::path::Path::new("/backups/inc"));
    assert_eq!(config.incremental_lsn, None);
    assert_eq!(
        config.incremental_basedir.as_deref(),
        Some(std::path::Path::new("/backups/full"))
    );
    assert_eq!(config.parallel, 2);
    assert!(!config.use_changed_page_bitmaps);
    assert_eq!(config.filters.databases, vec!["sales", "hr"]);
    Ok(())
}

#[test]
fn command_surface() {
    let cmd = cli::clap_command();
    let names: Vec<&str> = cmd.get_subcommands().map(|c| c.get_name()).collect();
    for expected in ["backup", "prepare", "copy-back"] {
        assert!(names.contains(&expected), "missing subcommand {expected}");
    }

    let conflict = cli::clap_command().try_get_matches_from([
        "hotbackup",
        "backup",
        "--incremental-basedir",
        "/backups/full",
        "--incremental-lsn",
        "5000",
    ]);
    assert!(conflict.is_err());

    let parsed = cli::parse_args(["hotbackup", "--log-format", "json", "prepare"]).unwrap();
    assert_eq!(parsed.log_format, Some(hotbackup::logging::LogFormat::Json));
    assert!(matches!(parsed.command, cli::Command::Prepare(_)));
}

#[test]
fn backup_prepare_copy_back_through_cli() -> hotbackup::Result<()> {
    let datadir = tempdir()?;
    let root = tempdir()?;
    common::write_tablespace(&datadir.path().join("db1/t1.ibd"), 11, &[100, 200, 300])?;
    common::write_redo(datadir.path(), 5000, 5100)?;

    let full = root.path().join("full");
    let restored = root.path().join("restored");
    let d = datadir.path().to_str().unwrap();
    let f = full.to_str().unwrap();
    let r = restored.to_str().unwrap();

    hotbackup::run(["hotbackup", "backup", "--datadir", d, "--target-dir", f])?;
    hotbackup::run(["hotbackup", "prepare", "--target-dir", f])?;
    assert_eq!(BackupMetadata::load(&full)?.backup_type, BackupType::LogApplied);
    hotbackup::run(["hotbackup", "copy-back", "--target-dir", f, "--datadir", r])?;

    assert_eq!(
        fs::read(restored.join("db1/t1.ibd"))?,
        fs::read(datadir.path().join("db1/t1.ibd"))?
    );
    Ok(())
}
