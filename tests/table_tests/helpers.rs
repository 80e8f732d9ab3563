//! Shared helpers for the table test suite

use std::path::Path;
use std::sync::Arc;

use stratadb::keys::{encode_internal_key, ValueType};
use stratadb::table::{DiskFile, TableBuilder, TableFile, TableReader};
use stratadb::TableOptions;

/// Internal key for a live value
pub fn ikey(user: &str, seq: u64) -> Vec<u8> {
    encode_internal_key(user.as_bytes(), seq, ValueType::Value)
}

/// Internal key for a tombstone
pub fn dkey(user: &str, seq: u64) -> Vec<u8> {
    encode_internal_key(user.as_bytes(), seq, ValueType::Deletion)
}

/// Build a table at `path` from pre-encoded entries, then sync and close it
pub fn build_table_file(
    path: &Path,
    options: &TableOptions,
    entries: &[(Vec<u8>, Vec<u8>)],
) -> u64 {
    let file: Arc<dyn TableFile> =
        Arc::new(DiskFile::create(path, options.write_buffer_size).unwrap());
    let mut builder = TableBuilder::new(options.clone(), Arc::clone(&file), 0).unwrap();
    for (key, value) in entries {
        builder.add(key, value).unwrap();
    }
    builder.finish().unwrap();
    file.sync().unwrap();
    file.close().unwrap();
    builder.file_size()
}

/// Open a reader over a finished table
pub fn open_reader(path: &Path, options: &TableOptions) -> TableReader {
    TableReader::open(path, options.clone()).unwrap()
}
