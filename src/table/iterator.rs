//! Table iterator
//!
//! Sequential iteration over every entry of a table, walking the index
//! block and loading one data block at a time.

use std::collections::VecDeque;

use crate::error::Result;
use crate::table::format::BlockHandle;
use crate::block::Block;

use super::reader::TableReader;

/// Iterator over `(internal_key, value)` pairs in key order
pub struct TableIterator<'a> {
    reader: &'a TableReader,
    /// Data block handles remaining, front first
    handles: VecDeque<BlockHandle>,
    /// Entries of the currently loaded block
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    /// Set once an error is produced; iteration ends there
    failed: bool,
}

impl<'a> TableIterator<'a> {
    pub(super) fn new(reader: &'a TableReader) -> Self {
        let (handles, failed) = match reader.block_handles() {
            Ok(handles) => (VecDeque::from(handles), false),
            Err(_) => (VecDeque::new(), true),
        };
        Self {
            reader,
            handles,
            entries: VecDeque::new(),
            failed,
        }
    }

    /// Load the next data block's entries
    fn load_next_block(&mut self) -> Result<bool> {
        let handle = match self.handles.pop_front() {
            Some(handle) => handle,
            None => return Ok(false),
        };
        let block = Block::new(self.reader.read_block(handle)?)?;
        let mut iter = block.iter();
        while let Some(entry) = iter.next_entry() {
            self.entries.push_back(entry);
        }
        Ok(true)
    }
}

impl<'a> Iterator for TableIterator<'a> {
    /// `(internal_key, value)`
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.entries.pop_front() {
                return Some(Ok(entry));
            }
            match self.load_next_block() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
