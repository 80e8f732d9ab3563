//! On-disk table format
//!
//! Shared constants and the small encoded structures: block trailers, block
//! handles, the footer, and CRC masking.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ data block 0 .. data block n                │  each: payload | type(1) | crc(4 LE)
//! ├─────────────────────────────────────────────┤
//! │ filter block (optional)                     │
//! │ meta-index block ("filter.<name>" → handle) │
//! │ index block (separator → handle)            │
//! │ counters block                              │
//! ├─────────────────────────────────────────────┤
//! │ footer: metaindex | index | pad | magic(8)  │  48 bytes
//! └─────────────────────────────────────────────┘
//! ```

use crc::{Crc, CRC_32_ISCSI};

use crate::coding::{decode_fixed64, get_varint64, put_fixed64, put_varint64};
use crate::error::Result;
use crate::StrataError;

/// Identifies the table version; readers reject files with any other magic
pub const TABLE_MAGIC: u64 = 0x5374_7261_7461_4231; // "StrataB1"

/// Every block is followed by a one-byte compression type and a 4-byte
/// masked CRC32C
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Fixed footer length: two maximal varint64 handle pairs plus the magic
pub const FOOTER_SIZE: usize = 48;

const MAX_ENCODED_HANDLE: usize = 10 + 10;

pub(crate) const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC32C over `payload || type_byte`
pub fn block_crc(payload: &[u8], type_byte: u8) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(payload);
    digest.update(&[type_byte]);
    digest.finalize()
}

const MASK_DELTA: u32 = 0xa282_ead8;

/// Rotate and offset a CRC so checksums of overlapping byte ranges do not
/// correlate
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Inverse of [`mask_crc`]
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// Locates a block within the file: offset and payload size, trailer
/// excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_ENCODED_HANDLE);
        self.encode_to(&mut out);
        out
    }

    /// Decode from the front of `src`, returning the remainder
    pub fn decode_from(src: &[u8]) -> Result<(Self, &[u8])> {
        let (offset, rest) = get_varint64(src)?;
        let (size, rest) = get_varint64(rest)?;
        Ok((Self { offset, size }, rest))
    }
}

/// Fixed-size footer closing every table file
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FOOTER_SIZE);
        self.metaindex_handle.encode_to(&mut out);
        self.index_handle.encode_to(&mut out);
        out.resize(2 * MAX_ENCODED_HANDLE, 0);
        put_fixed64(&mut out, TABLE_MAGIC);
        debug_assert_eq!(out.len(), FOOTER_SIZE);
        out
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != FOOTER_SIZE {
            return Err(StrataError::Corruption(format!(
                "footer is {} bytes, expected {}",
                src.len(),
                FOOTER_SIZE
            )));
        }
        let magic = decode_fixed64(&src[FOOTER_SIZE - 8..]);
        if magic != TABLE_MAGIC {
            return Err(StrataError::Corruption(format!(
                "bad table magic {:#018x}",
                magic
            )));
        }
        let (metaindex_handle, rest) = BlockHandle::decode_from(src)?;
        let (index_handle, _) = BlockHandle::decode_from(rest)?;
        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}
