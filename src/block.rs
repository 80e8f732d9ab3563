//! Data block encoding
//!
//! A block is a run of sorted key/value entries with shared-prefix key
//! compression, restarted every `RESTART_INTERVAL` entries so readers can
//! binary-search without decoding from the top.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │ Entry: shared u16 | unshared u16 | vlen u32 | key | v │
//! │   ... repeated ...                                    │
//! ├───────────────────────────────────────────────────────┤
//! │ restart offsets (u32 each) | restart count (u32)      │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! Fixed-width fields are big-endian.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::comparator::InternalKeyComparator;
use crate::error::Result;
use crate::StrataError;

const RESTART_INTERVAL: usize = 16;

/// Accumulates sorted entries into an encoded block
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    restart_interval: usize,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::with_restart_interval(RESTART_INTERVAL)
    }

    /// Index blocks use interval 1 so every entry is its own restart point
    pub fn with_restart_interval(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            restart_interval,
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Append an entry; `key` must sort after every previously added key
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let mut shared = 0;
        if self.entry_count % self.restart_interval == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
        } else {
            shared = shared_prefix_length(&self.last_key, key);
        }
        let unshared = key.len() - shared;

        self.buffer.write_u16::<BigEndian>(shared as u16).unwrap();
        self.buffer.write_u16::<BigEndian>(unshared as u16).unwrap();
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .unwrap();
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    /// Close the block and take its encoded bytes; the builder is left ready
    /// for reuse as if freshly constructed
    pub fn finish(&mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();

        let encoded = std::mem::take(&mut self.buffer);
        self.restart_positions.clear();
        self.entry_count = 0;
        self.last_key.clear();
        encoded
    }

    /// Reset to the freshly constructed state, discarding buffered entries
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restart_positions.clear();
        self.entry_count = 0;
        self.last_key.clear();
    }

    /// Encoded size if the block were finished now
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restart_positions.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    let min_len = a.len().min(b.len());
    let mut i = 0;
    while i < min_len && a[i] == b[i] {
        i += 1;
    }
    i
}

/// Decoded block: entry bytes plus the parsed restart array
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(StrataError::Corruption(
                "block shorter than restart count".to_string(),
            ));
        }

        let num_restarts_offset = data.len() - 4;
        let num_restarts = BigEndian::read_u32(&data[num_restarts_offset..]) as usize;

        let restart_array_size = num_restarts * 4;
        if num_restarts_offset < restart_array_size {
            return Err(StrataError::Corruption(
                "block too short for restart array".to_string(),
            ));
        }

        let restart_array_offset = num_restarts_offset - restart_array_size;
        let mut restart_positions = Vec::with_capacity(num_restarts);
        let mut cursor = &data[restart_array_offset..num_restarts_offset];
        for _ in 0..num_restarts {
            restart_positions.push(cursor.read_u32::<BigEndian>()?);
        }

        Ok(Self {
            data: data[..restart_array_offset].to_vec(),
            restart_positions,
        })
    }

    pub fn iter(&self) -> BlockIterator<'_> {
        BlockIterator::new(&self.data, &self.restart_positions)
    }

    pub fn is_empty(&self) -> bool {
        self.restart_positions.is_empty()
    }
}

/// Cursor over a decoded block's entries
pub struct BlockIterator<'a> {
    data: &'a [u8],
    restart_positions: &'a [u32],
    current_offset: usize,
    last_key: Vec<u8>,
}

impl<'a> BlockIterator<'a> {
    fn new(data: &'a [u8], restart_positions: &'a [u32]) -> Self {
        Self {
            data,
            restart_positions,
            current_offset: 0,
            last_key: Vec::new(),
        }
    }

    /// Position at the first entry whose key is `>= target` under `cmp` and
    /// return it, or `None` when every entry sorts before `target`.
    pub fn seek(
        &mut self,
        target: &[u8],
        cmp: &InternalKeyComparator,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.restart_positions.is_empty() {
            return None;
        }

        // Binary search the restart array for the last restart whose key
        // sorts before the target
        let mut left = 0usize;
        let mut right = self.restart_positions.len() - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let offset = self.restart_positions[mid] as usize;
            let (key, _, _) = self.decode_entry_at(offset, b"")?;
            if cmp.compare(&key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        // Linear scan forward from that restart point
        self.current_offset = self.restart_positions[left] as usize;
        self.last_key.clear();
        while let Some((key, value)) = self.next_entry() {
            if cmp.compare(&key, target) != Ordering::Less {
                return Some((key, value));
            }
        }
        None
    }

    /// Decode the next entry in block order
    pub fn next_entry(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.current_offset >= self.data.len() {
            return None;
        }
        let prev_key = std::mem::take(&mut self.last_key);
        let (key, value, next_offset) = self.decode_entry_at(self.current_offset, &prev_key)?;
        self.current_offset = next_offset;
        self.last_key = key.clone();
        Some((key, value))
    }

    /// Decode the entry at `offset`, resolving shared prefixes against
    /// `prev_key`. Returns key, value, and the offset one past the entry.
    fn decode_entry_at(
        &self,
        offset: usize,
        prev_key: &[u8],
    ) -> Option<(Vec<u8>, Vec<u8>, usize)> {
        let mut pos = offset;
        if pos + 8 > self.data.len() {
            return None;
        }

        let shared = BigEndian::read_u16(&self.data[pos..]) as usize;
        pos += 2;
        let unshared = BigEndian::read_u16(&self.data[pos..]) as usize;
        pos += 2;
        let value_len = BigEndian::read_u32(&self.data[pos..]) as usize;
        pos += 4;

        if shared > prev_key.len() || pos + unshared + value_len > self.data.len() {
            return None;
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&prev_key[..shared]);
        key.extend_from_slice(&self.data[pos..pos + unshared]);
        pos += unshared;

        let value = self.data[pos..pos + value_len].to_vec();
        pos += value_len;

        Some((key, value, pos))
    }
}
