//! Internal key encoding
//!
//! Every key flowing through the build path is an internal key: the user key
//! followed by an 8-byte trailer packing a 56-bit sequence number and a
//! one-byte record type.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ user key (n) │ fixed64le(seq << 8 | type)   │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! Within one user key, larger packed trailers sort first, so the newest
//! version of a key is always encountered before older ones.

use crate::coding::{decode_fixed64, put_fixed64};
use crate::error::Result;
use crate::StrataError;

/// Largest sequence number that fits in the 56-bit trailer field
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

/// Record type carried in the internal key trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Tombstone: the key was deleted at this sequence
    Deletion = 0,
    /// Live value
    Value = 1,
}

impl ValueType {
    fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            other => Err(StrataError::Corruption(format!(
                "unknown value type tag {}",
                other
            ))),
        }
    }
}

/// Type used when building seek keys: sorts before every stored entry
/// with the same user key and sequence.
pub const TYPE_FOR_SEEK: ValueType = ValueType::Value;

/// Encode `(user_key, seq, vtype)` into a fresh internal key
pub fn encode_internal_key(user_key: &[u8], seq: u64, vtype: ValueType) -> Vec<u8> {
    debug_assert!(seq <= MAX_SEQUENCE);
    let mut out = Vec::with_capacity(user_key.len() + 8);
    out.extend_from_slice(user_key);
    put_fixed64(&mut out, (seq << 8) | vtype as u64);
    out
}

/// Parsed view of an internal key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: u64,
    pub value_type: ValueType,
}

/// Split an internal key into its parts.
///
/// Keys shorter than the 8-byte trailer are corrupt.
pub fn parse_internal_key(key: &[u8]) -> Result<ParsedKey<'_>> {
    if key.len() < 8 {
        return Err(StrataError::Corruption(format!(
            "internal key too short ({} bytes)",
            key.len()
        )));
    }
    let (user_key, trailer) = key.split_at(key.len() - 8);
    let packed = decode_fixed64(trailer);
    Ok(ParsedKey {
        user_key,
        sequence: packed >> 8,
        value_type: ValueType::from_u8((packed & 0xff) as u8)?,
    })
}

/// The user-key prefix of an internal key.
///
/// Callers must have validated the key length (directly or through
/// [`parse_internal_key`]).
pub fn extract_user_key(key: &[u8]) -> &[u8] {
    debug_assert!(key.len() >= 8);
    &key[..key.len() - 8]
}
