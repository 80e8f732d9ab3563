//! Tests for the table reader
//!
//! These tests verify:
//! - Structural validation when opening a file
//! - Checksum rejection of corrupted blocks (any single byte flip)
//! - Tombstone and version-aware lookups
//! - Counters round-tripping through the file

use std::path::PathBuf;

use stratadb::counters::SstCounter;
use stratadb::{CompressionType, StrataError, TableOptions};
use tempfile::TempDir;

use crate::helpers::{build_table_file, dkey, ikey, open_reader};

fn setup_temp_table() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.sst");
    (temp_dir, path)
}

fn raw_options() -> TableOptions {
    TableOptions::builder()
        .compression(CompressionType::None)
        .build()
}

fn small_entries() -> Vec<(Vec<u8>, Vec<u8>)> {
    vec![
        (ikey("apple", 3), b"fruit".to_vec()),
        (ikey("banana", 2), b"fruit".to_vec()),
        (ikey("cherry", 1), b"fruit".to_vec()),
    ]
}

// =============================================================================
// Structural validation
// =============================================================================

#[test]
fn test_open_nonexistent_file() {
    let (_temp, path) = setup_temp_table();
    assert!(matches!(
        stratadb::TableReader::open(&path, TableOptions::default()),
        Err(StrataError::Io(_))
    ));
}

#[test]
fn test_open_truncated_file() {
    let (_temp, path) = setup_temp_table();
    std::fs::write(&path, b"way too short").unwrap();
    assert!(matches!(
        stratadb::TableReader::open(&path, TableOptions::default()),
        Err(StrataError::Corruption(_))
    ));
}

#[test]
fn test_open_bad_magic() {
    let (_temp, path) = setup_temp_table();
    let options = raw_options();
    build_table_file(&path, &options, &small_entries());

    let mut bytes = std::fs::read(&path).unwrap();
    let n = bytes.len();
    bytes[n - 1] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        stratadb::TableReader::open(&path, options),
        Err(StrataError::Corruption(_))
    ));
}

// =============================================================================
// Checksum verification
// =============================================================================

#[test]
fn test_flipped_payload_byte_rejected() {
    let (_temp, path) = setup_temp_table();
    let options = raw_options();
    build_table_file(&path, &options, &small_entries());

    let handle = {
        let reader = open_reader(&path, &options);
        reader.block_handles().unwrap()[0]
    };

    // Flip every byte position of the block payload in turn
    let pristine = std::fs::read(&path).unwrap();
    for position in handle.offset..handle.offset + handle.size {
        let mut bytes = pristine.clone();
        bytes[position as usize] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let reader = open_reader(&path, &options);
        assert!(
            matches!(reader.get(b"apple"), Err(StrataError::Corruption(_))),
            "flip at {} went undetected",
            position
        );
    }
}

#[test]
fn test_flipped_trailer_byte_rejected() {
    let (_temp, path) = setup_temp_table();
    let options = raw_options();
    build_table_file(&path, &options, &small_entries());

    let handle = {
        let reader = open_reader(&path, &options);
        reader.block_handles().unwrap()[0]
    };

    let pristine = std::fs::read(&path).unwrap();
    let trailer_start = handle.offset + handle.size;
    for position in trailer_start..trailer_start + 5 {
        let mut bytes = pristine.clone();
        bytes[position as usize] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let reader = open_reader(&path, &options);
        assert!(
            reader.get(b"apple").is_err(),
            "trailer flip at {} went undetected",
            position
        );
    }
}

// =============================================================================
// Lookups
// =============================================================================

#[test]
fn test_get_absent_key_returns_none() {
    let (_temp, path) = setup_temp_table();
    let options = raw_options();
    build_table_file(&path, &options, &small_entries());

    let reader = open_reader(&path, &options);
    assert_eq!(reader.get(b"aardvark").unwrap(), None);
    assert_eq!(reader.get(b"blueberry").unwrap(), None);
    assert_eq!(reader.get(b"zebra").unwrap(), None);
}

#[test]
fn test_get_tombstone_returns_none() {
    let (_temp, path) = setup_temp_table();
    let options = raw_options();
    let entries = vec![
        (ikey("alive", 5), b"yes".to_vec()),
        (dkey("dead", 4), Vec::new()),
    ];
    build_table_file(&path, &options, &entries);

    let reader = open_reader(&path, &options);
    assert_eq!(reader.get(b"alive").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(reader.get(b"dead").unwrap(), None);
}

#[test]
fn test_get_returns_newest_version() {
    let (_temp, path) = setup_temp_table();
    let options = raw_options();
    let entries = vec![
        (ikey("k", 10), b"new".to_vec()),
        (ikey("k", 5), b"old".to_vec()),
    ];
    build_table_file(&path, &options, &entries);

    let reader = open_reader(&path, &options);
    assert_eq!(reader.get(b"k").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_newest_tombstone_hides_older_value() {
    let (_temp, path) = setup_temp_table();
    let options = raw_options();
    let entries = vec![
        (dkey("k", 10), Vec::new()),
        (ikey("k", 5), b"old".to_vec()),
    ];
    build_table_file(&path, &options, &entries);

    let reader = open_reader(&path, &options);
    assert_eq!(reader.get(b"k").unwrap(), None);
}

// =============================================================================
// Counters
// =============================================================================

#[test]
fn test_counters_round_trip_through_file() {
    let (_temp, path) = setup_temp_table();
    let options = raw_options();
    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
        .map(|i| (ikey(&format!("key{:02}", i), 1), b"value".to_vec()))
        .collect();
    build_table_file(&path, &options, &entries);

    let reader = open_reader(&path, &options);
    let counters = reader.counters();
    assert_eq!(counters.value(SstCounter::Keys), 50);
    assert_eq!(counters.value(SstCounter::ValueBytes), 50 * 5);
    assert_eq!(
        counters.value(SstCounter::Blocks),
        reader.block_handles().unwrap().len() as u64
    );
    // key{:02} plus the 8-byte trailer
    assert_eq!(counters.value(SstCounter::KeyLargest), 13);
    assert_eq!(counters.value(SstCounter::KeySmallest), 13);
}
