use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of shards a default cluster splits every queue into.
pub const DEFAULT_SHARD_COUNT: i32 = 1024;

/// Lowest shard number; shards are numbered `1..=shard_count`.
pub const MIN_SHARD: i32 = 1;

/// A partition of a queue's keyspace.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ShardNumber(i32);

impl ShardNumber {
    pub fn value(&self) -> i32 {
        self.0
    }

    /// Create a shard number without knowing the cluster's shard count;
    /// only the lower bound is checked.
    pub fn new(shard: i32) -> Result<Self, crate::error::QueueError> {
        if shard < MIN_SHARD {
            return Err(crate::error::QueueError::InvalidConfig {
                reason: format!("shard {shard} is out of range (minimum: {MIN_SHARD})"),
            });
        }
        Ok(Self(shard))
    }

    pub(crate) fn new_unchecked(shard: i32) -> Self {
        Self(shard)
    }

    /// Create a shard number, rejecting values outside `1..=shard_count`.
    pub fn validated(shard: i32, shard_count: i32) -> Result<Self, crate::error::QueueError> {
        if !(MIN_SHARD..=shard_count).contains(&shard) {
            return Err(crate::error::QueueError::InvalidConfig {
                reason: format!("shard {shard} is out of range (valid: {MIN_SHARD}..={shard_count})"),
            });
        }
        Ok(Self(shard))
    }

    /// Every shard number of a cluster with `shard_count` shards, in order.
    pub fn all(shard_count: i32) -> impl Iterator<Item = ShardNumber> {
        (MIN_SHARD..=shard_count).map(ShardNumber)
    }
}

impl fmt::Display for ShardNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
