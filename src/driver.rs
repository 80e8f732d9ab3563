//! Table build orchestration
//!
//! Streams a sorted key/value iterator through the retirement filter into a
//! parallel [`TableBuilder`], verifies the finished file is readable, and
//! cleans up after any failure.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::config::TableOptions;
use crate::error::Result;
use crate::retirement::KeyRetirementFilter;
use crate::table::cache::{table_file_name, TableCache};
use crate::table::file::{DiskFile, TableFile};
use crate::table::TableBuilder;
use crate::StrataError;

/// Metadata describing one table file produced by a build
#[derive(Debug, Clone, Default)]
pub struct TableFileMeta {
    /// File number; names the file on disk
    pub number: u64,
    /// LSM level the table is destined for
    pub level: u32,
    /// Final file length; stays zero when nothing was written
    pub file_size: u64,
    /// First internal key in the table
    pub smallest: Vec<u8>,
    /// Last internal key in the table
    pub largest: Vec<u8>,
    /// Keys stored after retirement
    pub num_entries: u64,
}

/// Build one table file in `dir` from `input`.
///
/// `input` yields `(internal_key, value)` pairs in internal-key order.
/// Records retired against `smallest_snapshot` never reach the file. An
/// empty input succeeds without creating a file; any failure deletes the
/// partial file.
pub fn build_table<I>(
    dir: &Path,
    options: &TableOptions,
    cache: &TableCache,
    input: I,
    meta: &mut TableFileMeta,
    smallest_snapshot: u64,
) -> Result<()>
where
    I: IntoIterator<Item = Result<(Vec<u8>, Vec<u8>)>>,
{
    meta.file_size = 0;
    let mut input = input.into_iter().peekable();

    // Empty input: success, no file
    if input.peek().is_none() {
        return Ok(());
    }

    let mut retire = KeyRetirementFilter::new(options.comparator.clone(), smallest_snapshot);
    let path = table_file_name(dir, meta.number);

    let mut status = (|| -> Result<()> {
        let file: Arc<dyn TableFile> =
            Arc::new(DiskFile::create(&path, options.write_buffer_size)?);
        if !file.supports_parallel_builder() {
            return Err(StrataError::NotSupported(
                "table file does not support region reservation".to_string(),
            ));
        }
        let mut builder = TableBuilder::new(options.clone(), Arc::clone(&file), meta.level)?;

        let ingest = (|| -> Result<()> {
            let mut first = true;
            for item in &mut input {
                let (key, value) = item?;
                if first {
                    meta.smallest = key.clone();
                    first = false;
                }
                if !retire.retire(&key)? {
                    meta.largest.clear();
                    meta.largest.extend_from_slice(&key);
                    builder.add(&key, &value)?;
                    meta.num_entries += 1;
                }
            }
            Ok(())
        })();

        match ingest {
            Ok(()) if builder.ok() => {
                builder.finish()?;
                meta.file_size = builder.file_size();
                tracing::debug!(
                    number = meta.number,
                    entries = meta.num_entries,
                    retired = retire.dropped(),
                    file_size = meta.file_size,
                    "table build finished"
                );
            }
            outcome => {
                builder.abandon();
                outcome?;
                // Builder went bad without a caller-visible error
                builder.status()?;
            }
        }

        let timer = Instant::now();
        file.sync()?;
        tracing::info!(micros = timer.elapsed().as_micros() as u64, "table sync");

        let timer = Instant::now();
        file.close()?;
        tracing::info!(micros = timer.elapsed().as_micros() as u64, "table close");

        Ok(())
    })();

    // Confirm the finished table is readable before declaring success
    if status.is_ok() {
        status = cache.open(meta.number).map(|_| ());
    }

    if status.is_err() || meta.file_size == 0 {
        cache.evict(meta.number);
        let _ = std::fs::remove_file(&path);
    }
    status
}
