//! Tests for the parallel table builder
//!
//! These tests verify:
//! - Table construction from single keys up to multi-block files
//! - Index/block agreement: separators bound their blocks
//! - Compression fallback accounting for incompressible data
//! - Order enforcement and the sticky error status
//! - Abandon and teardown behavior

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use rand::RngCore;
use stratadb::comparator::{BytewiseComparator, InternalKeyComparator};
use stratadb::counters::SstCounter;
use stratadb::filter::BloomFilterPolicy;
use stratadb::keys::parse_internal_key;
use stratadb::table::{DiskFile, TableBuilder, TableFile};
use stratadb::{CompressionType, StrataError, TableOptions};
use tempfile::TempDir;

use crate::helpers::{build_table_file, ikey, open_reader};

fn setup_temp_table() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.sst");
    (temp_dir, path)
}

// =============================================================================
// Basic construction
// =============================================================================

#[test]
fn test_single_key_table() {
    let (_temp, path) = setup_temp_table();
    let options = TableOptions::default();

    let entries = vec![(ikey("a", 1), b"1".to_vec())];
    let file_size = build_table_file(&path, &options, &entries);
    assert!(file_size > 0);

    let reader = open_reader(&path, &options);
    assert_eq!(reader.counters().value(SstCounter::Keys), 1);
    assert_eq!(reader.counters().value(SstCounter::Blocks), 1);
    assert_eq!(reader.block_handles().unwrap().len(), 1);
    assert_eq!(reader.get(b"a").unwrap(), Some(b"1".to_vec()));

    // The single separator still covers the stored key
    let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
    let (separator, _) = reader.index_entries().unwrap().into_iter().next().unwrap();
    let (stored_key, _) = reader.iter().next().unwrap().unwrap();
    assert_eq!(parse_internal_key(&stored_key).unwrap().user_key, b"a");
    assert_ne!(icmp.compare(&stored_key, &separator), Ordering::Greater);
}

#[test]
fn test_multiblock_table_index_bounds_blocks() {
    let (_temp, path) = setup_temp_table();
    let options = TableOptions::builder()
        .block_size(4096)
        .compression(CompressionType::None)
        .build();

    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..10_000)
        .map(|i| (ikey(&format!("key{:05}", i), i as u64), b"8-bytes!".to_vec()))
        .collect();
    build_table_file(&path, &options, &entries);

    let reader = open_reader(&path, &options);
    let handles = reader.block_handles().unwrap();
    assert!(handles.len() > 1, "expected multiple blocks");
    assert_eq!(
        handles.len() as u64,
        reader.counters().value(SstCounter::Blocks)
    );
    assert_eq!(
        handles.len() as u64,
        reader.counters().value(SstCounter::IndexKeys)
    );

    // Offsets are strictly increasing and blocks tile the data section
    for pair in handles.windows(2) {
        assert!(pair[0].offset < pair[1].offset);
        assert_eq!(pair[0].offset + pair[0].size + 5, pair[1].offset);
    }

    // Every key comes back in the original order
    let decoded: Vec<Vec<u8>> = reader
        .iter()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(decoded.len(), entries.len());
    for (got, (want, _)) in decoded.iter().zip(&entries) {
        assert_eq!(got, want);
    }

    // Spot lookups across the file
    for i in [0usize, 1, 4999, 5000, 9998, 9999] {
        let user_key = format!("key{:05}", i);
        assert_eq!(
            reader.get(user_key.as_bytes()).unwrap(),
            Some(b"8-bytes!".to_vec()),
            "missing {}",
            user_key
        );
    }
}

#[test]
fn test_index_separators_partition_key_space() {
    let (_temp, path) = setup_temp_table();
    let options = TableOptions::builder()
        .block_size(512)
        .compression(CompressionType::None)
        .build();

    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..500)
        .map(|i| (ikey(&format!("key{:04}", i), 1), b"value".to_vec()))
        .collect();
    build_table_file(&path, &options, &entries);

    let reader = open_reader(&path, &options);
    let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
    let index = reader.index_entries().unwrap();
    assert!(index.len() > 1);

    // Each block's keys are <= its separator, and each separator sorts
    // before the first key of the following block
    for (i, (separator, handle)) in index.iter().enumerate() {
        let block = reader.block(*handle).unwrap();
        let mut iter = block.iter();
        let mut keys = Vec::new();
        while let Some((key, _)) = iter.next_entry() {
            keys.push(key);
        }
        assert!(!keys.is_empty());
        for key in &keys {
            assert_ne!(icmp.compare(key, separator), Ordering::Greater);
        }
        if let Some((_, next_handle)) = index.get(i + 1) {
            let next_block = reader.block(*next_handle).unwrap();
            let (first_key, _) = next_block.iter().next_entry().unwrap();
            assert_eq!(icmp.compare(separator, &first_key), Ordering::Less);
        }
    }
}

// =============================================================================
// Flush and block boundaries
// =============================================================================

#[test]
fn test_flush_forces_block_boundary() {
    let (_temp, path) = setup_temp_table();
    let options = TableOptions::builder()
        .compression(CompressionType::None)
        .build();

    let file: Arc<dyn TableFile> =
        Arc::new(DiskFile::create(&path, options.write_buffer_size).unwrap());
    let mut builder = TableBuilder::new(options.clone(), Arc::clone(&file), 0).unwrap();
    builder.add(&ikey("a", 3), b"1").unwrap();
    builder.add(&ikey("b", 2), b"2").unwrap();
    builder.flush();
    builder.add(&ikey("c", 1), b"3").unwrap();
    builder.finish().unwrap();
    file.sync().unwrap();
    file.close().unwrap();

    let reader = open_reader(&path, &options);
    assert_eq!(reader.block_handles().unwrap().len(), 2);
    assert_eq!(reader.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(reader.get(b"c").unwrap(), Some(b"3".to_vec()));
}

// =============================================================================
// Compression
// =============================================================================

#[test]
fn test_incompressible_blocks_stored_raw() {
    let (_temp, path) = setup_temp_table();
    let options = TableOptions::builder()
        .compression(CompressionType::Snappy)
        .write_buffer_size(8 * 1024 * 1024)
        .build();

    let mut rng = rand::thread_rng();
    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..8)
        .map(|i| {
            let mut value = vec![0u8; 64 * 1024];
            rng.fill_bytes(&mut value);
            (ikey(&format!("key{:02}", i), 1), value)
        })
        .collect();
    build_table_file(&path, &options, &entries);

    let reader = open_reader(&path, &options);
    let blocks = reader.counters().value(SstCounter::Blocks);
    assert!(blocks > 0);
    assert_eq!(
        reader.counters().value(SstCounter::CompressAborted),
        blocks,
        "every random block must fall back to raw storage"
    );

    for (key, value) in &entries {
        let user_key = parse_internal_key(key).unwrap().user_key;
        assert_eq!(reader.get(user_key).unwrap().as_deref(), Some(value.as_slice()));
    }
}

#[test]
fn test_compressible_blocks_shrink() {
    let (_temp, path) = setup_temp_table();
    let options = TableOptions::builder()
        .compression(CompressionType::Snappy)
        .build();

    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..2_000)
        .map(|i| (ikey(&format!("key{:05}", i), 1), vec![b'x'; 64]))
        .collect();
    build_table_file(&path, &options, &entries);

    let reader = open_reader(&path, &options);
    assert_eq!(reader.counters().value(SstCounter::CompressAborted), 0);
    assert!(
        reader.counters().value(SstCounter::BlockWrittenBytes)
            < reader.counters().value(SstCounter::BlockBytes)
    );
    assert_eq!(reader.get(b"key01000").unwrap(), Some(vec![b'x'; 64]));
}

// =============================================================================
// Filters
// =============================================================================

#[test]
fn test_bloom_filter_lookups() {
    let (_temp, path) = setup_temp_table();
    let options = TableOptions::builder()
        .filter_policy(Arc::new(BloomFilterPolicy::new(10)))
        .build();

    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
        .map(|i| (ikey(&format!("key{:03}", i), 1), format!("v{}", i).into_bytes()))
        .collect();
    build_table_file(&path, &options, &entries);

    let reader = open_reader(&path, &options);
    for i in 0..100 {
        let user_key = format!("key{:03}", i);
        assert_eq!(
            reader.get(user_key.as_bytes()).unwrap(),
            Some(format!("v{}", i).into_bytes())
        );
    }
    assert_eq!(reader.get(b"not-there").unwrap(), None);
}

// =============================================================================
// Error handling
// =============================================================================

#[test]
fn test_out_of_order_add_is_fatal() {
    let (_temp, path) = setup_temp_table();
    let options = TableOptions::default();

    let file: Arc<dyn TableFile> =
        Arc::new(DiskFile::create(&path, options.write_buffer_size).unwrap());
    let mut builder = TableBuilder::new(options, file, 0).unwrap();

    builder.add(&ikey("b", 1), b"1").unwrap();
    let err = builder.add(&ikey("a", 1), b"2").unwrap_err();
    assert!(matches!(err, StrataError::InvariantViolation(_)));

    // The status is sticky: later calls return the same failure
    let err = builder.add(&ikey("c", 1), b"3").unwrap_err();
    assert!(matches!(err, StrataError::InvariantViolation(_)));
    assert!(!builder.ok());
    builder.abandon();
}

#[test]
fn test_add_after_finish_fails() {
    let (_temp, path) = setup_temp_table();
    let options = TableOptions::default();

    let file: Arc<dyn TableFile> =
        Arc::new(DiskFile::create(&path, options.write_buffer_size).unwrap());
    let mut builder = TableBuilder::new(options, file, 0).unwrap();
    builder.add(&ikey("a", 1), b"1").unwrap();
    builder.finish().unwrap();

    assert!(builder.add(&ikey("b", 1), b"2").is_err());
}

#[test]
fn test_empty_finish_produces_metadata_only_file() {
    let (_temp, path) = setup_temp_table();
    let options = TableOptions::default();

    let file: Arc<dyn TableFile> =
        Arc::new(DiskFile::create(&path, options.write_buffer_size).unwrap());
    let mut builder = TableBuilder::new(options.clone(), Arc::clone(&file), 0).unwrap();
    builder.finish().unwrap();
    file.sync().unwrap();
    file.close().unwrap();

    let reader = open_reader(&path, &options);
    assert_eq!(reader.counters().value(SstCounter::Keys), 0);
    assert!(reader.block_handles().unwrap().is_empty());
    assert_eq!(reader.get(b"anything").unwrap(), None);
}
