//! Filter policies and the filter block
//!
//! A filter block lets readers rule out a key without touching the data
//! block. It is partitioned: one filter is generated per 2 KiB window of
//! data-block offsets, so a reader maps a block offset straight to the
//! filter that covers it.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ filter 0 | filter 1 | ...                    │
//! ├──────────────────────────────────────────────┤
//! │ filter offsets (u32 LE each)                 │
//! │ offset-array start (u32 LE) | base_lg (1B)   │
//! └──────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use crate::coding::{decode_fixed32, put_fixed32};
use crate::keys::extract_user_key;

/// Base-2 log of the offset window covered by one filter (2 KiB)
const FILTER_BASE_LG: u8 = 11;

/// Builds and probes per-block filters
pub trait FilterPolicy: Send + Sync {
    /// Name recorded in the meta-index block as `filter.<name>`
    fn name(&self) -> &'static str;

    /// Append a filter matching every key in `keys` to `dst`
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// May return false positives, never false negatives for keys the
    /// filter was built from
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

// =============================================================================
// Bloom filter
// =============================================================================

/// Bloom filter over user keys
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    probes: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // probes ≈ bits_per_key * ln(2), clamped to a useful range
        let probes = ((bits_per_key as f64) * 0.69) as usize;
        Self {
            bits_per_key,
            probes: probes.clamp(1, 30),
        }
    }
}

fn bloom_hash(key: &[u8]) -> u32 {
    hash_bytes(key, 0xbc9f1d34)
}

/// 32-bit multiplicative hash over a byte string
fn hash_bytes(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0xc6a4a793;
    let mut h = seed ^ (data.len() as u32).wrapping_mul(M);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let w = u32::from_le_bytes(chunk.try_into().unwrap());
        h = h.wrapping_add(w).wrapping_mul(M);
        h ^= h >> 16;
    }

    let rest = chunks.remainder();
    if !rest.is_empty() {
        let mut w = 0u32;
        for (i, &b) in rest.iter().enumerate() {
            w |= u32::from(b) << (8 * i);
        }
        h = h.wrapping_add(w).wrapping_mul(M);
        h ^= h >> 24;
    }
    h
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "stratadb.BloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let start = dst.len();
        dst.resize(start + bytes, 0);
        dst.push(self.probes as u8);
        let array = &mut dst[start..start + bytes];

        for key in keys {
            // Double hashing: successive probes differ by a rotated delta
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.probes {
                let bit = (h as usize) % bits;
                array[bit / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }
        let bytes = filter.len() - 1;
        let bits = bytes * 8;
        let probes = filter[bytes] as usize;
        if probes > 30 {
            // Reserved for future encodings; treat as a match
            return true;
        }

        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..probes {
            let bit = (h as usize) % bits;
            if filter[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

// =============================================================================
// Internal-key adapter
// =============================================================================

/// Strips internal-key trailers before delegating to a user-key policy.
///
/// The build path captures whole internal keys; lookups probe with a seek
/// key whose sequence differs from the stored one, so both sides must hash
/// only the user portion.
pub struct InternalFilterPolicy {
    user_policy: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user_policy: Arc<dyn FilterPolicy>) -> Self {
        Self { user_policy }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user_policy.name()
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let stripped: Vec<&[u8]> = keys.iter().map(|k| extract_user_key(k)).collect();
        self.user_policy.create_filter(&stripped, dst);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user_policy.key_may_match(extract_user_key(key), filter)
    }
}

// =============================================================================
// Filter block builder / reader
// =============================================================================

/// Accumulates keys per data block and emits the partitioned filter block
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Flattened key bytes since the last generated filter
    keys: Vec<u8>,
    /// Start offset of each key within `keys`
    starts: Vec<usize>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            starts: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Absorb the keys of one data block: `lengths[i]` slices `flat` into
    /// individual keys
    pub fn add_keys(&mut self, lengths: &[usize], flat: &[u8]) {
        debug_assert_eq!(lengths.iter().sum::<usize>(), flat.len());
        let mut cursor = 0;
        for &len in lengths {
            self.starts.push(self.keys.len());
            self.keys.extend_from_slice(&flat[cursor..cursor + len]);
            cursor += len;
        }
    }

    /// Note that the next data block begins at `block_offset`, generating
    /// filters for every completed 2 KiB window
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = (block_offset / (1 << FILTER_BASE_LG)) as usize;
        debug_assert!(filter_index >= self.filter_offsets.len());
        while self.filter_offsets.len() < filter_index {
            self.generate_filter();
        }
    }

    /// Emit the finished filter block
    pub fn finish(mut self) -> Vec<u8> {
        if !self.starts.is_empty() {
            self.generate_filter();
        }

        let array_start = self.result.len() as u32;
        for offset in &self.filter_offsets {
            put_fixed32(&mut self.result, *offset);
        }
        put_fixed32(&mut self.result, array_start);
        self.result.push(FILTER_BASE_LG);
        self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.starts.is_empty() {
            // No keys since the last filter
            return;
        }

        self.starts.push(self.keys.len()); // sentinel
        let keys: Vec<&[u8]> = self
            .starts
            .windows(2)
            .map(|w| &self.keys[w[0]..w[1]])
            .collect();
        self.policy.create_filter(&keys, &mut self.result);

        self.keys.clear();
        self.starts.clear();
    }
}

/// Probes a finished filter block
pub struct FilterBlockReader {
    data: Vec<u8>,
    /// Offset of the filter-offset array within `data`
    array_start: usize,
    filter_count: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Parse a filter block; malformed blocks yield a reader that matches
    /// everything (filters are advisory)
    pub fn new(data: Vec<u8>) -> Self {
        let mut reader = Self {
            data: Vec::new(),
            array_start: 0,
            filter_count: 0,
            base_lg: FILTER_BASE_LG,
        };
        if data.len() < 5 {
            return reader;
        }
        let base_lg = data[data.len() - 1];
        let array_start = decode_fixed32(&data[data.len() - 5..]) as usize;
        if array_start > data.len() - 5 {
            return reader;
        }
        reader.filter_count = (data.len() - 5 - array_start) / 4;
        reader.array_start = array_start;
        reader.base_lg = base_lg;
        reader.data = data;
        reader
    }

    /// Whether the filter covering `block_offset` may contain `key`
    pub fn key_may_match(
        &self,
        policy: &dyn FilterPolicy,
        block_offset: u64,
        key: &[u8],
    ) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.filter_count {
            return true;
        }
        let entry = self.array_start + index * 4;
        let start = decode_fixed32(&self.data[entry..]) as usize;
        let end = if index + 1 < self.filter_count {
            decode_fixed32(&self.data[entry + 4..]) as usize
        } else {
            self.array_start
        };
        if start > end || end > self.array_start {
            return true;
        }
        if start == end {
            // Empty filter covers no keys
            return false;
        }
        policy.key_may_match(key, &self.data[start..end])
    }
}
