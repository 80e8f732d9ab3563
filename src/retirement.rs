//! Key retirement
//!
//! While a compaction streams keys in engine order (user key ascending,
//! newest version first), obsolete versions can be dropped before they ever
//! reach a block: once a version is at or below the smallest live snapshot,
//! only the newest such version of each user key is still observable, and a
//! tombstone at that horizon shields nothing.

use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::keys::{parse_internal_key, ValueType};

/// Stateful predicate deciding which streamed keys to drop
pub struct KeyRetirementFilter {
    user_comparator: Arc<dyn Comparator>,
    smallest_snapshot: u64,
    /// User key of the most recent decision, if any
    previous: Option<Vec<u8>>,
    dropped: u64,
}

impl KeyRetirementFilter {
    pub fn new(user_comparator: Arc<dyn Comparator>, smallest_snapshot: u64) -> Self {
        Self {
            user_comparator,
            smallest_snapshot,
            previous: None,
            dropped: 0,
        }
    }

    /// Returns true when `internal_key` should be dropped from the output.
    ///
    /// Malformed keys surface as corruption and abort the build.
    pub fn retire(&mut self, internal_key: &[u8]) -> Result<bool> {
        let parsed = parse_internal_key(internal_key)?;

        let is_new_user_key = match &self.previous {
            None => true,
            Some(prev) => {
                self.user_comparator.compare(prev, parsed.user_key) != std::cmp::Ordering::Equal
            }
        };

        let retire = parsed.sequence <= self.smallest_snapshot
            && (!is_new_user_key || parsed.value_type == ValueType::Deletion);

        match &mut self.previous {
            Some(prev) => {
                prev.clear();
                prev.extend_from_slice(parsed.user_key);
            }
            None => self.previous = Some(parsed.user_key.to_vec()),
        }

        if retire {
            self.dropped += 1;
        }
        Ok(retire)
    }

    /// Number of keys dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
