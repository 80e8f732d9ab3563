//! Table build options
//!
//! Centralized configuration for the build path with sensible defaults.

use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::filter::FilterPolicy;

/// Per-block compression codec selector.
///
/// The discriminants are the on-disk type byte in each block trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// Store blocks verbatim
    None = 0,
    /// Snappy; falls back to raw storage when the codec does not pay off
    Snappy = 1,
}

impl CompressionType {
    pub(crate) fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

/// Options governing a single table build
#[derive(Clone)]
pub struct TableOptions {
    // -------------------------------------------------------------------------
    // Block layout
    // -------------------------------------------------------------------------
    /// Soft upper bound on uncompressed block size; reaching it flushes the
    /// current block into the pipeline
    pub block_size: usize,

    /// Codec applied to data blocks
    pub compression: CompressionType,

    // -------------------------------------------------------------------------
    // Key handling
    // -------------------------------------------------------------------------
    /// User-key total order plus separator shortening
    pub comparator: Arc<dyn Comparator>,

    /// When present, a filter block is built for negative lookups
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    // -------------------------------------------------------------------------
    // File handling
    // -------------------------------------------------------------------------
    /// Initial file preallocation in bytes
    pub write_buffer_size: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            compression: CompressionType::Snappy,
            comparator: Arc::new(BytewiseComparator),
            filter_policy: None,
            write_buffer_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

impl TableOptions {
    /// Create a new options builder
    pub fn builder() -> TableOptionsBuilder {
        TableOptionsBuilder::default()
    }
}

/// Builder for TableOptions
#[derive(Default)]
pub struct TableOptionsBuilder {
    options: TableOptions,
}

impl TableOptionsBuilder {
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.options.block_size = bytes;
        self
    }

    pub fn compression(mut self, codec: CompressionType) -> Self {
        self.options.compression = codec;
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.options.comparator = comparator;
        self
    }

    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.options.filter_policy = Some(policy);
        self
    }

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.options.write_buffer_size = bytes;
        self
    }

    pub fn build(self) -> TableOptions {
        self.options
    }
}
