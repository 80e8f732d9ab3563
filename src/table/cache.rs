//! Table cache
//!
//! Keeps opened readers keyed by file number so repeated lookups do not
//! re-parse the footer and index. The build driver opens each freshly
//! written table through here, which doubles as its readability check.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TableOptions;
use crate::error::Result;

use super::reader::TableReader;

/// File name for a table with the given number
pub fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("table_{:06}.sst", number))
}

/// Cache of open table readers
pub struct TableCache {
    dir: PathBuf,
    options: TableOptions,
    readers: Mutex<HashMap<u64, Arc<TableReader>>>,
}

impl TableCache {
    pub fn new(dir: &Path, options: TableOptions) -> Self {
        Self {
            dir: dir.to_path_buf(),
            options,
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or fetch the cached reader for) table `number`.
    ///
    /// Opening validates the footer, index, filter, and counters blocks, so
    /// a successful return means the file is readable.
    pub fn open(&self, number: u64) -> Result<Arc<TableReader>> {
        if let Some(reader) = self.readers.lock().get(&number) {
            return Ok(Arc::clone(reader));
        }

        let path = table_file_name(&self.dir, number);
        let reader = Arc::new(TableReader::open(&path, self.options.clone())?);
        self.readers.lock().insert(number, Arc::clone(&reader));
        Ok(reader)
    }

    /// Drop the cached reader for a table that is being deleted
    pub fn evict(&self, number: u64) {
        self.readers.lock().remove(&number);
    }

    /// Number of cached readers
    pub fn len(&self) -> usize {
        self.readers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.lock().is_empty()
    }
}
