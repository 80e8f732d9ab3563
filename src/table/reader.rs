//! Table reader
//!
//! Opens a finished table file, validates its structure, and serves point
//! lookups. Every block read re-verifies the masked CRC, so corrupt blocks
//! are rejected rather than decoded.
//!
//! Opening a table parses the footer, the index block, the meta-index
//! block, the filter block (when the table carries one), and the counters
//! block, which is exactly the readability check the build driver needs.

use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::block::Block;
use crate::coding::decode_fixed32;
use crate::comparator::InternalKeyComparator;
use crate::config::{CompressionType, TableOptions};
use crate::counters::TableCounters;
use crate::error::Result;
use crate::filter::{FilterBlockReader, FilterPolicy, InternalFilterPolicy};
use crate::keys::{encode_internal_key, parse_internal_key, ValueType, MAX_SEQUENCE, TYPE_FOR_SEEK};
use crate::table::file::read_exact_at;
use crate::table::format::{
    block_crc, unmask_crc, BlockHandle, Footer, BLOCK_TRAILER_SIZE, FOOTER_SIZE,
};
use crate::StrataError;

/// Read-only handle to one table file
pub struct TableReader {
    file: File,
    file_size: u64,
    options: TableOptions,
    icmp: InternalKeyComparator,
    index: Block,
    filter: Option<(FilterBlockReader, InternalFilterPolicy)>,
    counters: TableCounters,
}

impl TableReader {
    /// Open and validate a table file
    pub fn open(path: &Path, options: TableOptions) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(StrataError::Corruption(format!(
                "table file is {} bytes, smaller than the footer",
                file_size
            )));
        }

        let mut footer_bytes = [0u8; FOOTER_SIZE];
        read_exact_at(&file, &mut footer_bytes, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_bytes)?;

        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let index = Block::new(read_verified(&file, file_size, footer.index_handle)?)?;

        let metaindex = Block::new(read_verified(&file, file_size, footer.metaindex_handle)?)?;
        let filter = match options.filter_policy.as_ref() {
            Some(policy) => load_filter(&file, file_size, &metaindex, policy)?,
            None => None,
        };

        let counters = load_counters(&file, file_size, footer.index_handle)?;

        Ok(Self {
            file,
            file_size,
            options,
            icmp,
            index,
            filter,
            counters,
        })
    }

    /// Look up the newest visible version of `user_key`.
    ///
    /// Returns:
    /// - `Ok(Some(value))` — key present with a live value
    /// - `Ok(None)` — key absent, or its newest version is a tombstone
    pub fn get(&self, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let seek_key = encode_internal_key(user_key, MAX_SEQUENCE, TYPE_FOR_SEEK);

        let mut index_iter = self.index.iter();
        let (_, handle_bytes) = match index_iter.seek(&seek_key, &self.icmp) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let (handle, _) = BlockHandle::decode_from(&handle_bytes)?;

        if let Some((filter, policy)) = &self.filter {
            if !filter.key_may_match(policy, handle.offset, &seek_key) {
                return Ok(None);
            }
        }

        let block = Block::new(self.read_block(handle)?)?;
        let mut iter = block.iter();
        if let Some((internal_key, value)) = iter.seek(&seek_key, &self.icmp) {
            let parsed = parse_internal_key(&internal_key)?;
            if self
                .options
                .comparator
                .compare(parsed.user_key, user_key)
                == Ordering::Equal
            {
                return Ok(match parsed.value_type {
                    ValueType::Value => Some(value),
                    ValueType::Deletion => None,
                });
            }
        }
        Ok(None)
    }

    /// Iterate over every entry in key order
    pub fn iter(&self) -> super::iterator::TableIterator<'_> {
        super::iterator::TableIterator::new(self)
    }

    /// Index entries in order: `(separator_key, block_handle)`
    pub fn index_entries(&self) -> Result<Vec<(Vec<u8>, BlockHandle)>> {
        let mut entries = Vec::new();
        let mut iter = self.index.iter();
        while let Some((key, handle_bytes)) = iter.next_entry() {
            let (handle, _) = BlockHandle::decode_from(&handle_bytes)?;
            entries.push((key, handle));
        }
        Ok(entries)
    }

    /// Handles of all data blocks, in index order
    pub fn block_handles(&self) -> Result<Vec<BlockHandle>> {
        Ok(self.index_entries()?.into_iter().map(|(_, h)| h).collect())
    }

    /// Read, verify, and decode one data block
    pub fn block(&self, handle: BlockHandle) -> Result<Block> {
        Block::new(self.read_block(handle)?)
    }

    /// Counters recorded at build time
    pub fn counters(&self) -> &TableCounters {
        &self.counters
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Read and verify one data block
    pub(crate) fn read_block(&self, handle: BlockHandle) -> Result<Vec<u8>> {
        read_verified(&self.file, self.file_size, handle)
    }

    pub(crate) fn internal_comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }
}

/// Read a block payload plus trailer, verify the masked CRC over
/// `payload || type`, and decompress as the type byte dictates
fn read_verified(file: &File, file_size: u64, handle: BlockHandle) -> Result<Vec<u8>> {
    let total = handle.size + BLOCK_TRAILER_SIZE as u64;
    if handle.offset + total > file_size {
        return Err(StrataError::Corruption(format!(
            "block handle [{}, {}) reaches past end of file",
            handle.offset,
            handle.offset + total
        )));
    }

    let mut buf = vec![0u8; total as usize];
    read_exact_at(file, &mut buf, handle.offset)?;

    let payload = &buf[..handle.size as usize];
    let trailer = &buf[handle.size as usize..];
    let type_byte = trailer[0];
    let stored_crc = unmask_crc(decode_fixed32(&trailer[1..]));
    if stored_crc != block_crc(payload, type_byte) {
        return Err(StrataError::Corruption(format!(
            "block checksum mismatch at offset {}",
            handle.offset
        )));
    }

    match CompressionType::from_u8(type_byte) {
        Some(CompressionType::None) => {
            let payload_len = handle.size as usize;
            buf.truncate(payload_len);
            Ok(buf)
        }
        Some(CompressionType::Snappy) => {
            let mut decoder = snap::raw::Decoder::new();
            decoder.decompress_vec(payload).map_err(|e| {
                StrataError::Corruption(format!(
                    "snappy decompression failed at offset {}: {}",
                    handle.offset, e
                ))
            })
        }
        None => Err(StrataError::Corruption(format!(
            "unknown block compression type {}",
            type_byte
        ))),
    }
}

/// Find the filter handle in the meta-index block and load the filter
fn load_filter(
    file: &File,
    file_size: u64,
    metaindex: &Block,
    policy: &Arc<dyn FilterPolicy>,
) -> Result<Option<(FilterBlockReader, InternalFilterPolicy)>> {
    let wanted = format!("filter.{}", policy.name());
    let mut iter = metaindex.iter();
    while let Some((key, handle_bytes)) = iter.next_entry() {
        if key == wanted.as_bytes() {
            let (handle, _) = BlockHandle::decode_from(&handle_bytes)?;
            let data = read_verified(file, file_size, handle)?;
            return Ok(Some((
                FilterBlockReader::new(data),
                InternalFilterPolicy::new(Arc::clone(policy)),
            )));
        }
    }
    Ok(None)
}

/// The counters block fills the gap between the index block and the footer
fn load_counters(file: &File, file_size: u64, index_handle: BlockHandle) -> Result<TableCounters> {
    let start = index_handle.offset + index_handle.size + BLOCK_TRAILER_SIZE as u64;
    let footer_start = file_size - FOOTER_SIZE as u64;
    if footer_start < start + BLOCK_TRAILER_SIZE as u64 {
        return Err(StrataError::Corruption(
            "no room for a counters block before the footer".to_string(),
        ));
    }
    let size = footer_start - start - BLOCK_TRAILER_SIZE as u64;
    let payload = read_verified(file, file_size, BlockHandle::new(start, size))?;
    TableCounters::decode_from(&payload)
}
