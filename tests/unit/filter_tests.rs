use std::path::Path;

use hotbackup::{config::TableFilterConfig, error_kind, filter::TableFilter, Error, ErrorKind};

fn filter(cfg: TableFilterConfig) -> TableFilter {
    TableFilter::from_config(&cfg).expect("valid filter")
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn empty_filter_keeps_everything() {
    let f = filter(TableFilterConfig::default());
    assert!(!f.is_active());
    assert!(!f.skips(Path::new("sales/orders.ibd")));
    assert!(!f.skips(Path::new("ibdata1")));
}

#[test]
fn database_include_list() {
    let f = filter(TableFilterConfig {
        databases: strings(&["sales"]),
        ..Default::default()
    });
    assert!(f.is_active());
    assert!(!f.skips(Path::new("sales/orders.ibd")));
    assert!(f.skips(Path::new("hr/people.ibd")));
    assert!(f.skips(Path::new("hr/people.frm")));
    // Root files belong to no database.
    assert!(!f.skips(Path::new("ibdata1")));
    assert!(!f.skips(Path::new("hr")));
}

#[test]
fn database_exclude_wins_over_include() {
    let f = filter(TableFilterConfig {
        databases: strings(&["sales", "hr"]),
        databases_exclude: strings(&["hr"]),
        ..Default::default()
    });
    assert!(!f.skips_database("sales"));
    assert!(f.skips_database("hr"));
    assert!(f.skips_database("mysql"));
}

#[test]
fn table_patterns_match_qualified_names() {
    let f = filter(TableFilterConfig {
        tables: strings(&[r"^sales\.order"]),
        tables_exclude: strings(&[r"^sales\.orders_archive$"]),
        ..Default::default()
    });
    assert!(!f.skips(Path::new("sales/orders.ibd")));
    assert!(!f.skips(Path::new("sales/order_lines.ibd")));
    assert!(f.skips(Path::new("sales/orders_archive.ibd")));
    assert!(f.skips(Path::new("sales/customers.ibd")));
    assert!(f.skips(Path::new("hr/orders.ibd")));
}

#[test]
fn partitions_follow_their_table() {
    let f = filter(TableFilterConfig {
        tables_exclude: strings(&[r"^sales\.events$"]),
        ..Default::default()
    });
    assert!(f.skips(Path::new("sales/events#P#p2024.ibd")));
    assert!(!f.skips(Path::new("sales/events_daily#P#p1.ibd")));
}

#[test]
fn bad_regex_is_rejected() {
    let err = TableFilter::from_config(&TableFilterConfig {
        tables: strings(&["sales.(orders"]),
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidFilter(_))));
    assert_eq!(error_kind(&err), Some(ErrorKind::Usage));
}

#[test]
fn bad_database_name_is_rejected() {
    let err = TableFilter::from_config(&TableFilterConfig {
        databases_exclude: strings(&["a/b"]),
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidFilter(_))));
}
