//! Key comparators
//!
//! The user comparator defines the total order over user keys and the two
//! key-shortening operations the index block depends on. The internal
//! comparator layers sequence ordering on top: equal user keys sort newest
//! (highest sequence) first.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::coding::{decode_fixed64, put_fixed64};
use crate::keys::{extract_user_key, MAX_SEQUENCE, TYPE_FOR_SEEK};

/// Total order over user keys plus the separator-shortening operations
pub trait Comparator: Send + Sync {
    /// Name recorded in file metadata; readers refuse tables built with a
    /// differently named comparator.
    fn name(&self) -> &'static str;

    /// Three-way comparison of two user keys
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Shorten `start` in place to some key in `[start, limit)`.
    ///
    /// May leave `start` unchanged; must never move it to or past `limit`.
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);

    /// Shorten `key` in place to some key `>= key`
    fn find_short_successor(&self, key: &mut Vec<u8>);
}

/// Lexicographic byte-string comparator
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "stratadb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        // Length of the shared prefix
        let min_len = start.len().min(limit.len());
        let mut diff = 0;
        while diff < min_len && start[diff] == limit[diff] {
            diff += 1;
        }

        if diff >= min_len {
            // One key is a prefix of the other; nothing shorter exists
            return;
        }

        let byte = start[diff];
        if byte < 0xff && byte + 1 < limit[diff] {
            start[diff] = byte + 1;
            start.truncate(diff + 1);
            debug_assert_eq!(self.compare(start, limit), Ordering::Less);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        // Bump the first byte that can be bumped, drop the rest
        for i in 0..key.len() {
            if key[i] != 0xff {
                key[i] += 1;
                key.truncate(i + 1);
                return;
            }
        }
        // All 0xff: key is its own successor
    }
}

/// Orders internal keys: user key ascending, then sequence descending.
///
/// The shortening operations work on internal keys by shortening the user
/// portion and re-attaching a maximal trailer, so a shortened separator still
/// sorts at the very front of its user key's version group.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        debug_assert!(a.len() >= 8 && b.len() >= 8);
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => {
                let a_num = decode_fixed64(&a[a.len() - 8..]);
                let b_num = decode_fixed64(&b[b.len() - 8..]);
                // Higher sequence sorts first
                b_num.cmp(&a_num)
            }
            ord => ord,
        }
    }

    /// Shorten the internal key `start` toward `limit` (both internal keys)
    pub fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user.find_shortest_separator(&mut tmp, user_limit);

        if tmp.len() < user_start.len()
            && self.user.compare(user_start, &tmp) == Ordering::Less
        {
            // The user portion got shorter; pin the trailer to the maximum so
            // the separator stays ahead of every version of that user key
            put_fixed64(&mut tmp, (MAX_SEQUENCE << 8) | TYPE_FOR_SEEK as u64);
            debug_assert_eq!(self.compare(start, &tmp), Ordering::Less);
            debug_assert_eq!(self.compare(&tmp, limit), Ordering::Less);
            *start = tmp;
        }
    }

    /// Shorten the internal key to a short key `>=` it
    pub fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user.find_short_successor(&mut tmp);

        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less {
            put_fixed64(&mut tmp, (MAX_SEQUENCE << 8) | TYPE_FOR_SEEK as u64);
            debug_assert_eq!(self.compare(key, &tmp), Ordering::Less);
            *key = tmp;
        }
    }
}
