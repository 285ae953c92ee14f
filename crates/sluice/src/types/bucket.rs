use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest bucket a default cluster hands out (10-bit field: 0-1023).
pub const DEFAULT_MAX_BUCKET: i32 = (1 << 10) - 1; // 1023

/// Slice of the global identifier space owned by one node.
///
/// The bucket lands in the high bits of every id the node mints, so ids from
/// different buckets never collide. Range checks depend on the configured
/// maximum; see [`crate::identifier::IdLayout`].
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Bucket(i32);

impl Bucket {
    /// Get the inner integer value.
    pub fn value(&self) -> i32 {
        self.0
    }

    /// Create a `Bucket` without validation.
    /// Only for internal use where the value was already masked or checked.
    pub(crate) fn new_unchecked(bucket: i32) -> Self {
        Self(bucket)
    }

    /// Create a new `Bucket`, rejecting values outside `0..=max_bucket`.
    pub fn validated(bucket: i32, max_bucket: i32) -> Result<Self, BucketError> {
        if !(0..=max_bucket).contains(&bucket) {
            Err(BucketError {
                value: bucket,
                max_bucket,
            })
        } else {
            Ok(Self(bucket))
        }
    }
}

/// Error returned when a bucket is outside the configured range.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bucket {value} is out of range (valid: 0..={max_bucket})")]
pub struct BucketError {
    pub value: i32,
    pub max_bucket: i32,
}

impl From<BucketError> for crate::error::QueueError {
    fn from(err: BucketError) -> Self {
        crate::error::QueueError::InvalidConfig {
            reason: err.to_string(),
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
