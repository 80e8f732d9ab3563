//! Variable- and fixed-width integer encoding
//!
//! Varints follow the LEB128 layout used throughout the table format for
//! block handles and counter values; fixed-width integers are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::StrataError;

/// Append a u32 as a varint (1-5 bytes)
pub fn put_varint32(dst: &mut Vec<u8>, v: u32) {
    put_varint64(dst, v as u64);
}

/// Append a u64 as a varint (1-10 bytes)
pub fn put_varint64(dst: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        dst.push((v as u8) | 0x80);
        v >>= 7;
    }
    dst.push(v as u8);
}

/// Decode a varint u64 from the front of `src`.
///
/// Returns the value and the remainder of the slice.
pub fn get_varint64(src: &[u8]) -> Result<(u64, &[u8])> {
    let mut result: u64 = 0;
    for (i, &byte) in src.iter().enumerate().take(10) {
        result |= u64::from(byte & 0x7f) << (7 * i);
        if byte < 0x80 {
            return Ok((result, &src[i + 1..]));
        }
    }
    Err(StrataError::Corruption("bad varint64".to_string()))
}

/// Decode a varint u32 from the front of `src`.
pub fn get_varint32(src: &[u8]) -> Result<(u32, &[u8])> {
    let (v, rest) = get_varint64(src)?;
    u32::try_from(v)
        .map(|v| (v, rest))
        .map_err(|_| StrataError::Corruption("varint32 overflow".to_string()))
}

/// Append a u32 as 4 little-endian bytes
pub fn put_fixed32(dst: &mut Vec<u8>, v: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, v);
    dst.extend_from_slice(&buf);
}

/// Append a u64 as 8 little-endian bytes
pub fn put_fixed64(dst: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, v);
    dst.extend_from_slice(&buf);
}

/// Read 4 little-endian bytes as a u32; `src` must hold at least 4 bytes
pub fn decode_fixed32(src: &[u8]) -> u32 {
    LittleEndian::read_u32(src)
}

/// Read 8 little-endian bytes as a u64; `src` must hold at least 8 bytes
pub fn decode_fixed64(src: &[u8]) -> u64 {
    LittleEndian::read_u64(src)
}
