//! Per-table build counters
//!
//! Counters accumulate across the ingest thread and both workers, so each
//! cell is an atomic. The finished set is serialized into a small metadata
//! block near the end of the table file.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::coding::{get_varint32, get_varint64, put_varint32, put_varint64};
use crate::error::Result;
use crate::StrataError;

/// Serialization format revision
const COUNTERS_VERSION: u32 = 1;

/// Counter indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SstCounter {
    /// Keys added to the table
    Keys = 0,
    /// Data blocks emitted
    Blocks = 1,
    /// Blocks where compression ran but did not pay off
    CompressAborted = 2,
    /// Total bytes of all keys
    KeyBytes = 3,
    /// Total bytes of all values
    ValueBytes = 4,
    /// Total uncompressed data block bytes
    BlockBytes = 5,
    /// Total data block bytes as written (post-compression)
    BlockWrittenBytes = 6,
    /// Entries in the index block
    IndexKeys = 7,
    /// Largest key length seen
    KeyLargest = 8,
    /// Smallest key length seen
    KeySmallest = 9,
    /// Largest value length seen
    ValueLargest = 10,
    /// Smallest value length seen
    ValueSmallest = 11,
}

/// Number of counters in the array
pub const COUNTER_COUNT: usize = 12;

/// Atomic counter set for one table build
pub struct TableCounters {
    values: [AtomicU64; COUNTER_COUNT],
}

impl Default for TableCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl TableCounters {
    pub fn new() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment a counter by one
    pub fn inc(&self, which: SstCounter) {
        self.values[which as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Add an amount to a counter
    pub fn add(&self, which: SstCounter, amount: u64) {
        self.values[which as usize].fetch_add(amount, Ordering::Relaxed);
    }

    /// Raise a maximum-tracking counter
    pub fn observe_max(&self, which: SstCounter, candidate: u64) {
        self.values[which as usize].fetch_max(candidate, Ordering::Relaxed);
    }

    /// Lower a minimum-tracking counter (cells start at zero, so the first
    /// observation replaces it)
    pub fn observe_min(&self, which: SstCounter, candidate: u64) {
        let cell = &self.values[which as usize];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            if current != 0 && current <= candidate {
                return;
            }
            match cell.compare_exchange_weak(
                current,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    /// Current value of a counter
    pub fn value(&self, which: SstCounter) -> u64 {
        self.values[which as usize].load(Ordering::Relaxed)
    }

    /// Serialize: version, count, then each value, all varint-encoded
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint32(dst, COUNTERS_VERSION);
        put_varint32(dst, COUNTER_COUNT as u32);
        for cell in &self.values {
            put_varint64(dst, cell.load(Ordering::Relaxed));
        }
    }

    /// Decode a counter block produced by [`encode_to`].
    ///
    /// Any truncation, varint overrun, or unknown version is reported as
    /// corruption.
    pub fn decode_from(src: &[u8]) -> Result<Self> {
        let (version, rest) = get_varint32(src)?;
        if version != COUNTERS_VERSION {
            return Err(StrataError::Corruption(format!(
                "unknown counters version {}",
                version
            )));
        }
        let (count, mut rest) = get_varint32(rest)?;
        if count as usize != COUNTER_COUNT {
            return Err(StrataError::Corruption(format!(
                "counters block holds {} entries, expected {}",
                count, COUNTER_COUNT
            )));
        }
        let counters = Self::new();
        for cell in &counters.values {
            let (v, r) = get_varint64(rest)?;
            cell.store(v, Ordering::Relaxed);
            rest = r;
        }
        if !rest.is_empty() {
            return Err(StrataError::Corruption(
                "trailing bytes after counters block".to_string(),
            ));
        }
        Ok(counters)
    }
}
