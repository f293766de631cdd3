//! # Table Lifecycle and Point Operations
//!
//! Covers creation, reopening, point lookups, replacement, deletion,
//! key-length boundaries, the closed-handle latch, and file management.

use basalt::{Table, TableError, MAX_KEY_LEN};
use tempfile::tempdir;

fn get(table: &mut Table, key: &[u8]) -> Option<Vec<u8>> {
    let mut tag = Vec::new();
    if table.get_exact_entry(key, &mut tag).unwrap() {
        Some(tag)
    } else {
        None
    }
}

#[test]
fn create_add_commit_reopen_reads_value() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    table.create_and_open(2048).unwrap();
    table.add(b"a", b"1", false).unwrap();
    table.commit(1).unwrap();

    let mut reader = Table::new(dir.path(), "probe", true);
    reader.open().unwrap();

    assert_eq!(get(&mut reader, b"a"), Some(b"1".to_vec()));
    assert_eq!(reader.tree_level(), 0);
    assert_eq!(reader.item_count(), 1);
    assert_eq!(reader.revision(), 1);
}

#[test]
fn add_without_create_lazily_creates_the_table() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "lazy", false);

    table.add(b"k", b"v", false).unwrap();
    table.commit(1).unwrap();

    assert!(table.exists());
    assert_eq!(get(&mut table, b"k"), Some(b"v".to_vec()));
}

#[test]
fn empty_value_roundtrips() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    table.create_and_open(2048).unwrap();
    table.add(b"empty", b"", false).unwrap();
    table.commit(1).unwrap();

    assert_eq!(get(&mut table, b"empty"), Some(Vec::new()));
    assert_eq!(table.item_count(), 1);
}

#[test]
fn replacement_keeps_item_count_and_returns_new_value() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    table.create_and_open(2048).unwrap();

    table.add(b"k", b"first", false).unwrap();
    table.add(b"k", b"second value, rather longer than the first", false).unwrap();
    table.add(b"k", b"3", false).unwrap();
    table.commit(1).unwrap();

    assert_eq!(get(&mut table, b"k"), Some(b"3".to_vec()));
    assert_eq!(table.item_count(), 1);
}

#[test]
fn del_reports_presence_and_updates_item_count() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    table.create_and_open(2048).unwrap();

    table.add(b"one", b"1", false).unwrap();
    table.add(b"two", b"2", false).unwrap();
    assert_eq!(table.item_count(), 2);

    assert!(table.del(b"one").unwrap());
    assert!(!table.del(b"one").unwrap());
    assert!(!table.del(b"never-there").unwrap());
    assert_eq!(table.item_count(), 1);

    table.commit(1).unwrap();
    assert_eq!(get(&mut table, b"one"), None);
    assert_eq!(get(&mut table, b"two"), Some(b"2".to_vec()));
}

#[test]
fn key_exists_matches_get() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    table.create_and_open(2048).unwrap();
    table.add(b"present", b"x", false).unwrap();

    assert!(table.key_exists(b"present").unwrap());
    assert!(!table.key_exists(b"absent").unwrap());
}

#[test]
fn key_length_boundaries() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    table.create_and_open(2048).unwrap();

    let one = vec![b'x'; 1];
    let max = vec![b'y'; MAX_KEY_LEN];
    let over = vec![b'z'; MAX_KEY_LEN + 1];

    table.add(&one, b"1", false).unwrap();
    table.add(&max, b"max", false).unwrap();
    assert_eq!(get(&mut table, &one), Some(b"1".to_vec()));
    assert_eq!(get(&mut table, &max), Some(b"max".to_vec()));

    // Oversized keys fail loudly on add, harmlessly everywhere else.
    let err = table.add(&over, b"v", false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TableError>(),
        Some(TableError::Unimplemented(_))
    ));
    assert!(!table.del(&over).unwrap());
    assert!(!table.key_exists(&over).unwrap());
    assert_eq!(get(&mut table, &over), None);

    // The empty key cannot exist either.
    let err = table.add(b"", b"v", false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TableError>(),
        Some(TableError::Unimplemented(_))
    ));
    assert!(!table.del(b"").unwrap());
    assert_eq!(get(&mut table, b""), None);

    assert_eq!(table.item_count(), 2);
}

#[test]
fn out_of_range_block_size_falls_back_to_default() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    table.create_and_open(3000).unwrap();
    assert_eq!(table.block_size(), 8192);

    let mut table2 = Table::new(dir.path(), "probe2", false);
    table2.create_and_open(1 << 20).unwrap();
    assert_eq!(table2.block_size(), 8192);
}

#[test]
fn exists_and_erase() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    assert!(!table.exists());

    table.create_and_open(2048).unwrap();
    table.add(b"k", b"v", false).unwrap();
    table.commit(1).unwrap();
    assert!(table.exists());

    table.erase();
    assert!(!table.exists());
    assert!(!dir.path().join("probeDB").exists());
    assert!(!dir.path().join("probebaseA").exists());
    assert!(!dir.path().join("probebaseB").exists());
}

#[test]
fn permanent_close_latches_the_handle() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    table.create_and_open(2048).unwrap();
    table.add(b"k", b"v", false).unwrap();
    table.commit(1).unwrap();

    table.close(true);

    let mut tag = Vec::new();
    for err in [
        table.add(b"k", b"v", false).unwrap_err(),
        table.del(b"k").unwrap_err(),
        table.get_exact_entry(b"k", &mut tag).unwrap_err(),
        table.commit(2).unwrap_err(),
        table.cancel().unwrap_err(),
        table.open().unwrap_err(),
    ] {
        assert!(matches!(
            err.downcast_ref::<TableError>(),
            Some(TableError::Closed)
        ));
    }
}

#[test]
fn read_only_handle_rejects_mutation() {
    let dir = tempdir().unwrap();
    let mut writer = Table::new(dir.path(), "probe", false);
    writer.create_and_open(2048).unwrap();
    writer.commit(1).unwrap();

    let mut reader = Table::new(dir.path(), "probe", true);
    reader.open().unwrap();

    assert!(reader.add(b"k", b"v", false).is_err());
    assert!(reader.del(b"k").is_err());
    assert!(reader.commit(2).is_err());
}

#[test]
fn opening_a_missing_table_is_an_opening_error() {
    let dir = tempdir().unwrap();
    let mut reader = Table::new(dir.path(), "absent", true);
    let err = reader.open().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TableError>(),
        Some(TableError::Opening(_))
    ));
}

#[test]
fn commit_of_an_empty_table_stays_empty_after_reopen() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    table.create_and_open(2048).unwrap();
    table.commit(1).unwrap();

    let mut reader = Table::new(dir.path(), "probe", true);
    reader.open().unwrap();
    assert_eq!(reader.item_count(), 0);
    assert_eq!(get(&mut reader, b"anything"), None);

    let mut cursor = reader.cursor_get().unwrap();
    cursor.find_entry(b"").unwrap();
    assert!(!cursor.next().unwrap());
}

#[test]
fn deleting_every_key_collapses_back_to_an_empty_table() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "probe", false);
    table.create_and_open(2048).unwrap();

    for i in 0..500u32 {
        table
            .add(format!("key{i:04}").as_bytes(), &[0xAB; 64], false)
            .unwrap();
    }
    table.commit(1).unwrap();
    assert!(table.tree_level() > 0);

    for i in 0..500u32 {
        assert!(table.del(format!("key{i:04}").as_bytes()).unwrap());
    }
    table.commit(2).unwrap();

    assert_eq!(table.item_count(), 0);
    assert_eq!(table.tree_level(), 0);
    let mut cursor = table.cursor_get().unwrap();
    cursor.find_entry(b"").unwrap();
    assert!(!cursor.next().unwrap());
}
