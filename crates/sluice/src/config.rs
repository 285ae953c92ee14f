use crate::error::QueueError;
use crate::hash::lock_id_for;
use crate::identifier::IdLayout;
use crate::types::{QueueName, DEFAULT_MAX_BUCKET, DEFAULT_SHARD_COUNT};
use std::time::Duration;

/// Smallest and largest number of rows one sweep statement may delete.
pub const MIN_SWEEP_ROWS: u32 = 100;
pub const DEFAULT_SWEEP_ROWS: u32 = 1_000;
pub const MAX_SWEEP_ROWS: u32 = 100_000;

/// Bounds on the number of delete statements one sweep may run.
pub const MIN_SWEEP_ITERATIONS: u32 = 1;
pub const DEFAULT_SWEEP_ITERATIONS: u32 = 5;
pub const MAX_SWEEP_ITERATIONS: u32 = 100;

/// Probability (percent) that a receive call triggers a sweep.
pub const MIN_SWEEP_PROBABILITY: f64 = 0.0;
pub const DEFAULT_SWEEP_PROBABILITY: f64 = 20.0;
pub const MAX_SWEEP_PROBABILITY: f64 = 100.0;

/// Default advisory lock id for sweeping a queue.
///
/// Deterministic across processes and restarts, so every node contends on
/// the same lock for the same queue.
pub fn default_sweep_lock_id(queue: &QueueName) -> i64 {
    lock_id_for(&format!("sweep-{}", queue.as_str()))
}

/// Configuration for the inline sweep of dead messages.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Whether receive calls sweep at all. Default: true.
    pub enabled: bool,
    /// Maximum rows removed by one delete statement. Default: 1000.
    pub max_rows: u32,
    /// Maximum delete statements per sweep. Default: 5.
    pub max_iterations: u32,
    /// Chance, in percent, that a receive call triggers a sweep. Each call
    /// draws independently. Default: 20.
    pub probability: f64,
    /// Maps a queue to the advisory lock id guarding its sweep. Override when
    /// the application already uses advisory locks in the same id space.
    pub lock_id_generator: fn(&QueueName) -> i64,
}

impl SweepConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - `max_rows` in `[100, 100_000]`
    /// - `max_iterations` in `[1, 100]`
    /// - `probability` in `[0, 100]` (and not NaN)
    pub fn validate(&self) -> Result<(), QueueError> {
        if !(MIN_SWEEP_ROWS..=MAX_SWEEP_ROWS).contains(&self.max_rows) {
            return Err(QueueError::invalid_config(format!(
                "max_rows must be in [{MIN_SWEEP_ROWS}, {MAX_SWEEP_ROWS}], got {}",
                self.max_rows
            )));
        }
        if !(MIN_SWEEP_ITERATIONS..=MAX_SWEEP_ITERATIONS).contains(&self.max_iterations) {
            return Err(QueueError::invalid_config(format!(
                "max_iterations must be in [{MIN_SWEEP_ITERATIONS}, {MAX_SWEEP_ITERATIONS}], got {}",
                self.max_iterations
            )));
        }
        if !(MIN_SWEEP_PROBABILITY..=MAX_SWEEP_PROBABILITY).contains(&self.probability) {
            return Err(QueueError::invalid_config(format!(
                "probability must be in [{MIN_SWEEP_PROBABILITY}, {MAX_SWEEP_PROBABILITY}], got {}",
                self.probability
            )));
        }
        Ok(())
    }

    /// A config that never sweeps inline.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rows: DEFAULT_SWEEP_ROWS,
            max_iterations: DEFAULT_SWEEP_ITERATIONS,
            probability: DEFAULT_SWEEP_PROBABILITY,
            lock_id_generator: default_sweep_lock_id,
        }
    }
}

/// Configuration for node and shard bootstrap.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Largest identifier bucket. Fixes the id bit layout. Default: 1023.
    pub max_bucket: i32,
    /// Number of shards, numbered `1..=shard_count`. Default: 1024.
    pub shard_count: i32,
    /// Shard rows written per insert statement. Default: 100.
    pub shard_insert_batch: usize,
    /// Length of generated server ids. Default: 12.
    pub server_id_length: usize,
}

/// Longest server id the node and shard tables can store.
pub const SERVER_ID_MAX_LENGTH: usize = 100;

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_bucket < 0 {
            return Err(QueueError::invalid_config(format!(
                "max_bucket must be >= 0, got {}",
                self.max_bucket
            )));
        }
        if self.shard_count < 1 {
            return Err(QueueError::invalid_config(format!(
                "shard_count must be >= 1, got {}",
                self.shard_count
            )));
        }
        if self.shard_insert_batch == 0 {
            return Err(QueueError::invalid_config(
                "shard_insert_batch must be >= 1",
            ));
        }
        if !(1..=SERVER_ID_MAX_LENGTH).contains(&self.server_id_length) {
            return Err(QueueError::invalid_config(format!(
                "server_id_length must be in [1, {SERVER_ID_MAX_LENGTH}], got {}",
                self.server_id_length
            )));
        }
        Ok(())
    }

    /// Id layout matching `max_bucket`.
    pub fn id_layout(&self) -> Result<IdLayout, QueueError> {
        IdLayout::new(self.max_bucket)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_bucket: DEFAULT_MAX_BUCKET,
            shard_count: DEFAULT_SHARD_COUNT,
            shard_insert_batch: 100,
            server_id_length: 12,
        }
    }
}

/// Per-queue defaults applied when a message or receive call does not
/// override them.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Delivery attempts before a message is dead. Default: 5.
    pub default_attempts: i32,
    /// Delay before a freshly sent message becomes visible. Default: zero.
    pub default_delay: Duration,
    /// How long a leased message stays hidden from other consumers.
    /// Default: 60s.
    pub visibility_timeout: Duration,
}

impl QueueOptions {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.default_attempts < 1 {
            return Err(QueueError::invalid_config(format!(
                "default_attempts must be >= 1, got {}",
                self.default_attempts
            )));
        }
        Ok(())
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            default_attempts: 5,
            default_delay: Duration::ZERO,
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// Messages per insert chunk when a send does not say otherwise.
pub const DEFAULT_SEND_BATCH_SIZE: usize = 500;

/// What a batched send does when one chunk fails.
///
/// A batch is inserted in chunks of [`SendOptions::batch_size`] messages;
/// one failing message fails its whole chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PartialInsert {
    /// Any failure fails every message of the batch. Nothing is written.
    #[default]
    Prohibited,
    /// Keep the chunks before the first failing one; fail it and every
    /// chunk after it.
    UntilFirstFailure,
    /// Skip failing chunks and keep every chunk that succeeded.
    InsertAsManyAsPossible,
}

/// Options of a batched send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Messages per chunk, and so the failure granularity. Default: 500.
    pub batch_size: usize,
    /// Default: [`PartialInsert::Prohibited`].
    pub partial_insert: PartialInsert,
}

impl SendOptions {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.batch_size == 0 {
            return Err(QueueError::invalid_config("batch_size must be >= 1"));
        }
        Ok(())
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SEND_BATCH_SIZE,
            partial_insert: PartialInsert::Prohibited,
        }
    }
}
