//! # Bulk Loads, Chunked Tags, and Compression
//!
//! Exercises the sequential-mode split heuristics with an ascending load,
//! multi-component storage of long tags, the deflate path with its
//! incompressible fallback, and ordered cursor traversal in both
//! directions.

use basalt::{CompressStrategy, Table};
use tempfile::tempdir;

fn key(i: u32) -> Vec<u8> {
    format!("k{i:05}").into_bytes()
}

fn value(i: u32, len: usize) -> Vec<u8> {
    format!("value-{i:05}-")
        .into_bytes()
        .into_iter()
        .cycle()
        .take(len)
        .collect()
}

/// Deterministic bytes deflate cannot shrink, for forcing multi-component
/// storage.
fn noise(mut seed: u32, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        out.push((seed >> 24) as u8);
    }
    out
}

fn get(table: &mut Table, key: &[u8]) -> Option<Vec<u8>> {
    let mut tag = Vec::new();
    if table.get_exact_entry(key, &mut tag).unwrap() {
        Some(tag)
    } else {
        None
    }
}

#[test]
fn ascending_bulk_load_sets_sequential_and_enumerates_in_order() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "bulk", false);
    table.create_and_open(2048).unwrap();

    for i in 0..10_000 {
        table.add(&key(i), &value(i, 200), false).unwrap();
    }
    table.commit(1).unwrap();

    assert!(table.is_sequential());
    assert_eq!(table.item_count(), 10_000);

    let mut reader = Table::new(dir.path(), "bulk", true);
    reader.open().unwrap();
    assert!(reader.is_sequential());
    assert_eq!(reader.item_count(), 10_000);

    // The cursor must yield every key exactly once, ascending.
    let mut cursor = reader.cursor_get().unwrap();
    cursor.find_entry(b"").unwrap();
    let mut seen = 0u32;
    while cursor.next().unwrap() {
        assert_eq!(cursor.key(), key(seen).as_slice(), "at position {seen}");
        seen += 1;
    }
    assert_eq!(seen, 10_000);
    drop(cursor);

    // A spread of point lookups returns the loaded values.
    for i in (0..10_000).step_by(101) {
        assert_eq!(get(&mut reader, &key(i)), Some(value(i, 200)));
    }
}

#[test]
fn descending_load_splits_at_midpoint_and_still_reads_back() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "desc", false);
    table.create_and_open(2048).unwrap();

    for i in (0..2_000).rev() {
        table.add(&key(i), &value(i, 100), false).unwrap();
    }
    table.commit(1).unwrap();

    assert!(!table.is_sequential());
    assert_eq!(table.item_count(), 2_000);
    for i in (0..2_000).step_by(37) {
        assert_eq!(get(&mut table, &key(i)), Some(value(i, 100)));
    }

    // Off the sequential fast path the cursor descends the tree; it must
    // still visit every key exactly once, in order.
    let mut cursor = table.cursor_get().unwrap();
    cursor.find_entry(b"").unwrap();
    let mut seen = 0u32;
    while cursor.next().unwrap() {
        assert_eq!(cursor.key(), key(seen).as_slice());
        seen += 1;
    }
    assert_eq!(seen, 2_000);

    let mut remaining = 2_000;
    assert!(cursor.find_entry(&key(1_999)).unwrap());
    loop {
        remaining -= 1;
        if !cursor.prev().unwrap() {
            break;
        }
    }
    assert_eq!(remaining, 0);
}

#[test]
fn long_tag_is_chunked_and_reassembled_exactly() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "chunk", false);
    table.create_and_open(2048).unwrap();

    for i in 0..100 {
        table.add(&key(i), &value(i, 200), false).unwrap();
    }
    table.commit(1).unwrap();

    // Far larger than one 2 KiB block, and incompressible so the chunking
    // itself is what's exercised.
    let big = noise(42, 20_000);
    table.add(&key(42), &big, false).unwrap();
    table.commit(2).unwrap();

    assert_eq!(table.item_count(), 100);
    let read = get(&mut table, &key(42)).unwrap();
    assert_eq!(read.len(), 20_000);
    assert_eq!(read, big);

    // Deleting the key removes every component.
    assert!(table.del(&key(42)).unwrap());
    table.commit(3).unwrap();
    assert_eq!(table.item_count(), 99);
    assert_eq!(get(&mut table, &key(42)), None);

    // The neighbours are untouched.
    assert_eq!(get(&mut table, &key(41)), Some(value(41, 200)));
    assert_eq!(get(&mut table, &key(43)), Some(value(43, 200)));
}

#[test]
fn shrinking_a_chunked_tag_deletes_stale_components() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "shrink", false);
    table.create_and_open(2048).unwrap();

    let big = noise(7, 12_000);
    table.add(b"entry", &big, false).unwrap();
    table.add(b"entry", b"tiny", false).unwrap();
    table.commit(1).unwrap();

    assert_eq!(table.item_count(), 1);
    assert_eq!(get(&mut table, b"entry"), Some(b"tiny".to_vec()));

    // And back up again across a commit boundary.
    let bigger = noise(8, 30_000);
    table.add(b"entry", &bigger, false).unwrap();
    table.commit(2).unwrap();
    assert_eq!(get(&mut table, b"entry"), Some(bigger));
    assert_eq!(table.item_count(), 1);
}

#[test]
fn compressible_tag_is_stored_compressed_and_inflates_on_read() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "zip", false);
    table.create_and_open(2048).unwrap();

    let tag = value(1, 10_000);
    table.add(b"doc", &tag, false).unwrap();
    table.commit(1).unwrap();

    assert_eq!(get(&mut table, b"doc"), Some(tag.clone()));

    let mut cursor = table.cursor_get().unwrap();
    assert!(cursor.find_entry(b"doc").unwrap());
    let mut raw = Vec::new();
    let compressed = cursor.read_raw_tag(&mut raw).unwrap();
    assert!(compressed);
    assert!(raw.len() < tag.len());
}

#[test]
fn incompressible_and_tiny_tags_are_stored_raw() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "raw", false);
    table.create_and_open(2048).unwrap();

    let rand = noise(3, 256);
    table.add(b"noise", &rand, false).unwrap();
    table.add(b"tiny", b"abcd", false).unwrap();
    table.commit(1).unwrap();

    let mut cursor = table.cursor_get().unwrap();

    assert!(cursor.find_entry(b"noise").unwrap());
    let mut raw = Vec::new();
    assert!(!cursor.read_raw_tag(&mut raw).unwrap());
    assert_eq!(raw, rand);

    assert!(cursor.find_entry(b"tiny").unwrap());
    assert!(!cursor.read_raw_tag(&mut raw).unwrap());
    assert_eq!(raw, b"abcd");
}

#[test]
fn already_compressed_tags_move_between_tables_without_recompression() {
    let dir = tempdir().unwrap();
    let mut source = Table::new(dir.path(), "src", false);
    source.create_and_open(2048).unwrap();
    let tag = value(9, 5_000);
    source.add(b"doc", &tag, false).unwrap();
    source.commit(1).unwrap();

    let mut copy = Table::new(dir.path(), "copy", false);
    copy.create_and_open(2048).unwrap();
    {
        let mut cursor = source.cursor_get().unwrap();
        assert!(cursor.find_entry(b"doc").unwrap());
        let mut raw = Vec::new();
        let compressed = cursor.read_raw_tag(&mut raw).unwrap();
        assert!(compressed);
        copy.add(b"doc", &raw, compressed).unwrap();
    }
    copy.commit(1).unwrap();

    assert_eq!(get(&mut copy, b"doc"), Some(tag));
}

#[test]
fn dont_compress_strategy_stores_everything_raw() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "plain", false);
    table.set_compress_strategy(CompressStrategy::DontCompress);
    table.create_and_open(2048).unwrap();

    let tag = value(2, 4_000);
    table.add(b"doc", &tag, false).unwrap();
    table.commit(1).unwrap();

    let mut cursor = table.cursor_get().unwrap();
    assert!(cursor.find_entry(b"doc").unwrap());
    let mut raw = Vec::new();
    assert!(!cursor.read_raw_tag(&mut raw).unwrap());
    assert_eq!(raw, tag);
}

#[test]
fn chunk_boundary_tag_sizes_roundtrip() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "edge", false);
    table.set_compress_strategy(CompressStrategy::DontCompress);
    table.create_and_open(2048).unwrap();

    // With a 2048 block, max_item_size is 507 and a one-byte key leaves
    // 499 tag bytes per chunk; probe around that boundary.
    for (i, len) in [498usize, 499, 500, 998, 999, 1000].into_iter().enumerate() {
        let k = [b'a' + i as u8];
        table.add(&k, &noise(i as u32 + 1, len), false).unwrap();
    }
    table.commit(1).unwrap();

    for (i, len) in [498usize, 499, 500, 998, 999, 1000].into_iter().enumerate() {
        let k = [b'a' + i as u8];
        assert_eq!(get(&mut table, &k), Some(noise(i as u32 + 1, len)));
    }
}

#[test]
fn cursor_walks_both_directions() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "walk", false);
    table.create_and_open(2048).unwrap();

    for i in 0..500 {
        table.add(&key(i), &value(i, 50), false).unwrap();
    }
    table.commit(1).unwrap();

    let mut cursor = table.cursor_get().unwrap();

    // Forward from before-begin.
    cursor.find_entry(b"").unwrap();
    let mut forward = Vec::new();
    while cursor.next().unwrap() {
        forward.push(cursor.key().to_vec());
    }
    assert_eq!(forward.len(), 500);
    assert!(forward.windows(2).all(|w| w[0] < w[1]));

    // Backward from the last key.
    assert!(cursor.find_entry(&key(499)).unwrap());
    let mut backward = vec![cursor.key().to_vec()];
    while cursor.prev().unwrap() {
        backward.push(cursor.key().to_vec());
    }
    assert_eq!(backward.len(), 500);
    backward.reverse();
    assert_eq!(forward, backward);
}

#[test]
fn find_entry_positions_at_greatest_key_at_most_target() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "find", false);
    table.create_and_open(2048).unwrap();
    for k in [b"b" as &[u8], b"d", b"f"] {
        table.add(k, b"v", false).unwrap();
    }
    table.commit(1).unwrap();

    let mut cursor = table.cursor_get().unwrap();

    assert!(cursor.find_entry(b"d").unwrap());
    assert_eq!(cursor.key(), b"d");

    assert!(!cursor.find_entry(b"e").unwrap());
    assert_eq!(cursor.key(), b"d");

    assert!(!cursor.find_entry(b"a").unwrap());
    assert_eq!(cursor.key(), b"");
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.key(), b"b");

    assert!(!cursor.find_entry(b"zzz").unwrap());
    assert_eq!(cursor.key(), b"f");
    assert!(!cursor.next().unwrap());

    // A key longer than the codec supports cannot match, but still
    // positions the cursor.
    let huge = vec![b'z'; 300];
    assert!(!cursor.find_entry(&huge).unwrap());
    assert_eq!(cursor.key(), b"f");
}

#[test]
fn cursor_reads_tags_while_scanning() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "scan", false);
    table.create_and_open(2048).unwrap();

    for i in 0..50 {
        table.add(&key(i), &value(i, 700), false).unwrap();
    }
    table.commit(1).unwrap();

    let mut cursor = table.cursor_get().unwrap();
    cursor.find_entry(b"").unwrap();
    let mut i = 0u32;
    let mut tag = Vec::new();
    while cursor.next().unwrap() {
        assert_eq!(cursor.key(), key(i).as_slice());
        cursor.read_tag(&mut tag).unwrap();
        assert_eq!(tag, value(i, 700));
        i += 1;
    }
    assert_eq!(i, 50);
}

#[test]
fn full_compaction_load_reads_back() {
    let dir = tempdir().unwrap();
    let mut table = Table::new(dir.path(), "packed", false);
    table.create_and_open(2048).unwrap();
    table.set_full_compaction(true);

    for i in 0..3_000 {
        table.add(&key(i), &value(i, 120), false).unwrap();
    }
    table.commit(1).unwrap();

    assert_eq!(table.item_count(), 3_000);
    for i in (0..3_000).step_by(83) {
        assert_eq!(get(&mut table, &key(i)), Some(value(i, 120)));
    }
}
