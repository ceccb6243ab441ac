use std::{fs, os::unix::fs::FileExt};

use hotbackup::{bitmap::ChangedPageIndex, error_kind, ErrorKind};
use tempfile::tempdir;

#[path = "../common/mod.rs"]
mod common;

use common::{bitmap_block, write_bitmap_file};

/// Two runs: [100, 200] touching space 5 and [200, 300] touching spaces 5
/// and 6.
fn two_runs(dir: &std::path::Path) -> hotbackup::Result<std::path::PathBuf> {
    write_bitmap_file(
        dir,
        1,
        100,
        &[
            bitmap_block(5, 0, 100, 200, true, &[1, 3]),
            bitmap_block(5, 0, 200, 300, false, &[4]),
            bitmap_block(6, 0, 200, 300, true, &[0, 2]),
        ],
    )
}

#[test]
fn index_merges_runs_covering_the_range() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    two_runs(dir.path())?;

    let index = ChangedPageIndex::build(dir.path(), 150, 300)?;
    assert_eq!(index.len(), 2);
    for page in [1, 3, 4] {
        assert!(index.has_changed(5, page), "space 5 page {page}");
    }
    for page in [0, 2, 5, 40_000] {
        assert!(!index.has_changed(5, page), "space 5 page {page}");
    }
    assert!(index.has_changed(6, 0));
    assert!(index.has_changed(6, 2));
    assert!(!index.has_changed(6, 1));
    assert!(!index.has_changed(7, 0));
    Ok(())
}

#[test]
fn range_walks_set_and_clear_bits() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    two_runs(dir.path())?;
    let index = ChangedPageIndex::build(dir.path(), 150, 300)?;

    let mut range = index.range(5);
    assert_eq!(range.next_bit(true), Some(1));
    assert_eq!(range.next_bit(false), Some(2));
    assert_eq!(range.next_bit(true), Some(3));
    assert_eq!(range.next_bit(true), Some(4));
    assert_eq!(range.next_bit(false), Some(5));

    let mut from = index.range_from(5, 4);
    assert_eq!(from.next_bit(true), Some(4));
    assert_eq!(index.range(9).next_bit(true), None);
    Ok(())
}

#[test]
fn merge_order_does_not_matter() {
    let a = bitmap_block(3, 0, 10, 20, true, &[1, 7, 9]);
    let b = bitmap_block(3, 0, 20, 30, true, &[2, 7, 100]);

    let mut ab = ChangedPageIndex::empty(10, 30);
    ab.insert(a.clone());
    ab.insert(b.clone());
    let mut ba = ChangedPageIndex::empty(10, 30);
    ba.insert(b);
    ba.insert(a);

    for page in 0..200 {
        assert_eq!(ab.has_changed(3, page), ba.has_changed(3, page), "page {page}");
    }
    assert!(ab.has_changed(3, 100));
    assert!(ab.has_changed(3, 1));
    assert!(!ab.has_changed(3, 3));
}

#[test]
fn range_starting_before_first_file_is_missing() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    two_runs(dir.path())?;
    let err = ChangedPageIndex::build(dir.path(), 50, 300).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::MissingRange));
    Ok(())
}

#[test]
fn range_ending_past_last_file_is_missing() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    two_runs(dir.path())?;
    let err = ChangedPageIndex::build(dir.path(), 150, 400).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::MissingRange));
    Ok(())
}

#[test]
fn no_bitmap_files_is_missing() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    let err = ChangedPageIndex::build(dir.path(), 150, 300).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::MissingRange));
    Ok(())
}

#[test]
fn bad_block_checksum_is_corrupt() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    let path = two_runs(dir.path())?;
    let file = fs::OpenOptions::new().write(true).open(&path)?;
    // Flip a payload byte of the second block.
    file.write_all_at(&[0xFF], 4096 + 100)?;

    let err = ChangedPageIndex::build(dir.path(), 150, 300).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Corrupt));
    Ok(())
}

#[test]
fn empty_interval_needs_no_files() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    two_runs(dir.path())?;
    let index = ChangedPageIndex::build(dir.path(), 300, 300)?;
    assert!(index.is_empty());
    Ok(())
}

#[test]
fn inverted_interval_is_inconsistent() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    let err = ChangedPageIndex::build(dir.path(), 400, 300).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Inconsistent));
    Ok(())
}

#[test]
fn index_reads_on_through_an_empty_file() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    write_bitmap_file(dir.path(), 1, 100, &[bitmap_block(5, 0, 100, 200, true, &[1])])?;
    write_bitmap_file(dir.path(), 2, 200, &[])?;
    write_bitmap_file(dir.path(), 3, 200, &[bitmap_block(5, 0, 200, 300, true, &[7])])?;

    let index = ChangedPageIndex::build(dir.path(), 150, 300)?;
    assert_eq!(index.len(), 1);
    assert!(index.has_changed(5, 1));
    assert!(index.has_changed(5, 7));
    assert!(!index.has_changed(5, 2));
    Ok(())
}

#[test]
fn leading_empty_file_is_skipped() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    write_bitmap_file(dir.path(), 1, 100, &[])?;
    write_bitmap_file(
        dir.path(),
        2,
        100,
        &[
            bitmap_block(5, 0, 100, 200, true, &[1]),
            bitmap_block(5, 0, 200, 300, true, &[4]),
        ],
    )?;

    let index = ChangedPageIndex::build(dir.path(), 150, 300)?;
    assert!(index.has_changed(5, 1));
    assert!(index.has_changed(5, 4));
    Ok(())
}

#[test]
fn gap_in_file_sequence_is_missing() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    write_bitmap_file(dir.path(), 1, 100, &[bitmap_block(5, 0, 100, 200, true, &[1])])?;
    write_bitmap_file(dir.path(), 3, 300, &[bitmap_block(5, 0, 300, 400, true, &[2])])?;

    let err = ChangedPageIndex::build(dir.path(), 150, 400).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::MissingRange));
    Ok(())
}

#[test]
fn run_cut_off_at_end_of_file_is_corrupt() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    write_bitmap_file(
        dir.path(),
        1,
        100,
        &[
            bitmap_block(5, 0, 100, 200, true, &[1]),
            bitmap_block(5, 0, 200, 300, false, &[2]),
        ],
    )?;
    write_bitmap_file(dir.path(), 2, 300, &[bitmap_block(5, 0, 300, 400, true, &[3])])?;

    let err = ChangedPageIndex::build(dir.path(), 150, 400).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Corrupt));
    Ok(())
}

#[test]
fn partial_block_at_file_tail_is_ignored() -> hotbackup::Result<()> {
    let dir = tempdir()?;
    let first =
        write_bitmap_file(dir.path(), 1, 100, &[bitmap_block(5, 0, 100, 200, true, &[1])])?;
    let file = fs::OpenOptions::new().write(true).open(&first)?;
    file.write_all_at(&[0xAB; 100], 4096)?;
    write_bitmap_file(dir.path(), 2, 200, &[bitmap_block(5, 0, 200, 300, true, &[2])])?;

    let index = ChangedPageIndex::build(dir.path(), 150, 300)?;
    assert!(index.has_changed(5, 1));
    assert!(index.has_changed(5, 2));
    Ok(())
}
