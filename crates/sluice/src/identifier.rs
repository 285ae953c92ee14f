//! Coordination-free identifiers.
//!
//! An id is a non-negative `i64` split into two fields:
//!
//! ```text
//! | sign (always 0) | bucket (bucket_bits) | sequence (63 - bucket_bits) |
//! ```
//!
//! Every node owns one bucket and mints ids by combining it with a local,
//! monotonically increasing sequence (a database sequence in production).
//! Nodes never talk to each other to do so, ids from different buckets
//! never collide, and ids from one bucket are roughly time ordered.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::QueueError;
use crate::types::{Bucket, DEFAULT_MAX_BUCKET};

/// Bit layout derived once from the configured maximum bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdLayout {
    max_bucket: i32,
    bucket_bits: u32,
    sequence_bits: u32,
    sequence_mask: i64,
}

/// Decomposed parts of an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    pub bucket: Bucket,
    pub sequence: i64,
}

impl IdLayout {
    /// Build the layout for buckets `0..=max_bucket`.
    ///
    /// The bucket field is `ceil(log2(max_bucket + 1))` bits wide; the
    /// sequence field takes the remaining bits minus the sign bit.
    pub fn new(max_bucket: i32) -> Result<Self, QueueError> {
        if max_bucket < 0 {
            return Err(QueueError::invalid_config(format!(
                "max_bucket must be >= 0, got {max_bucket}"
            )));
        }
        Ok(Self::compute(max_bucket))
    }

    const fn compute(max_bucket: i32) -> Self {
        let bucket_bits = u32::BITS - (max_bucket as u32).leading_zeros();
        let sequence_bits = i64::BITS - 1 - bucket_bits;
        Self {
            max_bucket,
            bucket_bits,
            sequence_bits,
            sequence_mask: i64::MAX >> bucket_bits,
        }
    }

    pub fn max_bucket(&self) -> i32 {
        self.max_bucket
    }

    pub fn bucket_bits(&self) -> u32 {
        self.bucket_bits
    }

    pub fn sequence_bits(&self) -> u32 {
        self.sequence_bits
    }

    /// Largest sequence value the sequence field can hold.
    pub fn max_sequence(&self) -> i64 {
        self.sequence_mask
    }

    /// Combine a bucket and a sequence value into one id.
    ///
    /// A bucket above the configured maximum is a configuration error, and a
    /// sequence outside the sequence field is rejected rather than truncated.
    pub fn encode(&self, bucket: Bucket, sequence: i64) -> Result<i64, QueueError> {
        let bucket = Bucket::validated(bucket.value(), self.max_bucket)?;
        if !(0..=self.sequence_mask).contains(&sequence) {
            return Err(QueueError::IdentifierOverflow {
                bucket,
                sequence,
                bits: self.sequence_bits,
            });
        }
        Ok(((bucket.value() as i64) << self.sequence_bits) | (sequence & self.sequence_mask))
    }

    /// Split an id back into its bucket and sequence.
    pub fn decode(&self, id: i64) -> Result<IdParts, QueueError> {
        if id < 0 {
            return Err(QueueError::MalformedId {
                input: id.to_string(),
            });
        }
        Ok(IdParts {
            bucket: Bucket::new_unchecked((id >> self.sequence_bits) as i32),
            sequence: id & self.sequence_mask,
        })
    }
}

impl Default for IdLayout {
    fn default() -> Self {
        Self::compute(DEFAULT_MAX_BUCKET)
    }
}

/// Inclusive range of ids one bucket can mint.
///
/// Used to bound a node's id sequence (`minvalue`/`maxvalue`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierRange {
    pub start: i64,
    pub end: i64,
}

impl IdentifierRange {
    /// Range for a deployment without buckets.
    pub const LOCAL: IdentifierRange = IdentifierRange {
        start: 0,
        end: i64::MAX,
    };

    pub fn for_bucket(layout: &IdLayout, bucket: Bucket) -> Result<Self, QueueError> {
        let start = layout.encode(bucket, 0)?;
        Ok(Self {
            start,
            end: start | layout.max_sequence(),
        })
    }

    pub fn contains(&self, id: i64) -> bool {
        (self.start..=self.end).contains(&id)
    }
}

/// Lock-free, process-local stand-in for a database sequence.
///
/// Mints ids for one bucket; used by the in-memory storage backend.
pub struct LocalSequence {
    layout: IdLayout,
    bucket: Bucket,
    next: AtomicI64,
}

impl LocalSequence {
    pub fn new(layout: IdLayout, bucket: Bucket) -> Result<Self, QueueError> {
        // Reject a bad bucket now rather than on the first insert.
        layout.encode(bucket, 0)?;
        Ok(Self {
            layout,
            bucket,
            next: AtomicI64::new(1),
        })
    }

    /// Next id from this sequence.
    pub fn next_id(&self) -> Result<i64, QueueError> {
        let sequence = self.next.fetch_add(1, Ordering::AcqRel);
        self.layout.encode(self.bucket, sequence)
    }
}
