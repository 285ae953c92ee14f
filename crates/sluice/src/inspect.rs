//! Read-only views of a queue for monitoring: counts, message age and the
//! distinct values of a meta column.
//!
//! Distinct values are read from a `TABLESAMPLE` of the queue table, so on a
//! large table they are estimates; rare values may be missing.

use std::sync::Arc;
use std::time::Duration;

use crate::condition::{Condition, Field, MetaScalar, MetaValue, SortOrder};
use crate::error::QueueError;
use crate::lifecycle::MessageCounts;
use crate::queue::{MetaColumn, Queue};
use crate::queue_storage::QueueStorage;

/// Share of the table sampled when the size is left to [`Sample::Auto`].
pub const DEFAULT_SAMPLE_PERCENT: f32 = 1.0;
pub const READ_ALL_SAMPLE_PERCENT: f32 = 100.0;

/// Page bounds of an automatic sample, whatever the table size.
pub const MIN_SAMPLE_PAGES: i64 = 100;
pub const MAX_SAMPLE_PAGES: i64 = 1_000;

/// Age of the messages currently in a queue.
///
/// Every field is `None` when no message qualifies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageAge {
    /// Since the earliest message still in the queue was sent.
    pub oldest: Option<Duration>,
    /// Since the latest message was sent.
    pub newest: Option<Duration>,
    /// How long the longest-waiting ready or retry message has been due.
    pub oldest_ready: Option<Duration>,
}

/// Truncated to milliseconds; negative ages (clock skew) read as zero.
pub(crate) fn age_from_seconds(seconds: f64) -> Duration {
    Duration::from_millis((seconds.max(0.0) * 1000.0) as u64)
}

/// How much of the table a distinct-values scan reads.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Sample {
    /// Chosen from the table size, see [`sample_percent_for_pages`].
    #[default]
    Auto,
    /// Percent of the table's pages, in `(0, 100]`.
    Percent(f32),
}

/// Options of [`QueueStorage::distinct_values`].
#[derive(Debug, Clone, Default)]
pub struct DistinctValuesOptions {
    pub sample: Sample,
    /// Only consider messages matching this condition.
    pub filter: Option<Condition>,
    /// Sort by count. `None` leaves the order to the backend.
    pub order: Option<SortOrder>,
}

impl DistinctValuesOptions {
    pub fn validate(&self) -> Result<(), QueueError> {
        if let Sample::Percent(percent) = self.sample {
            if !(percent > 0.0 && percent <= READ_ALL_SAMPLE_PERCENT) {
                return Err(QueueError::invalid_config(format!(
                    "sample percent must be in (0, {READ_ALL_SAMPLE_PERCENT}], got {percent}"
                )));
            }
        }
        Ok(())
    }
}

/// One distinct meta value and how many messages carry it. `None` stands
/// for messages without a value.
#[derive(Debug, Clone, PartialEq)]
pub struct DistinctValue {
    pub value: Option<MetaValue>,
    pub count: i64,
}

/// Sample percent for a table of `pages` pages: about
/// [`DEFAULT_SAMPLE_PERCENT`], but never fewer than [`MIN_SAMPLE_PAGES`] or
/// more than [`MAX_SAMPLE_PAGES`] pages.
pub fn sample_percent_for_pages(pages: i64) -> f32 {
    if pages <= 0 {
        return READ_ALL_SAMPLE_PERCENT;
    }
    let wanted = (pages as f64 * f64::from(DEFAULT_SAMPLE_PERCENT) / 100.0) as i64;
    let to_scan = wanted.clamp(MIN_SAMPLE_PAGES, MAX_SAMPLE_PAGES);
    let percent = (100.0 * to_scan as f64 / pages as f64) as f32;
    percent.min(READ_ALL_SAMPLE_PERCENT)
}

/// Scale a count taken over a `percent` sample up to the whole table.
pub(crate) fn scale_count(count: i64, percent: f32) -> i64 {
    (count as f64 * 100.0 / f64::from(percent)) as i64
}

/// The declared meta column named `column`.
pub(crate) fn declared_column<'q>(queue: &'q Queue, column: &str) -> Result<&'q MetaColumn, QueueError> {
    queue
        .meta_columns()
        .iter()
        .find(|m| m.column == column)
        .ok_or_else(|| {
            QueueError::invalid_config(format!(
                "column '{column}' is not a meta column of queue '{}'",
                queue.name()
            ))
        })
}

/// Reads statistics of one queue.
pub struct Inspector<S: ?Sized> {
    storage: Arc<S>,
    queue: Queue,
}

impl<S: QueueStorage + ?Sized> Inspector<S> {
    pub fn new(storage: Arc<S>, queue: Queue) -> Self {
        Self { storage, queue }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub async fn count(&self, filter: Option<&Condition>) -> Result<MessageCounts, QueueError> {
        self.storage.count(&self.queue, filter).await
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        self.storage.is_empty(&self.queue).await
    }

    pub async fn is_dead_or_empty(&self) -> Result<bool, QueueError> {
        self.storage.is_dead_or_empty(&self.queue).await
    }

    pub async fn message_age(&self) -> Result<MessageAge, QueueError> {
        self.storage.message_age(&self.queue).await
    }

    /// Up to `limit` distinct values of `field` with their (estimated)
    /// message counts.
    pub async fn distinct_values<T: MetaScalar>(
        &self,
        field: &Field<T>,
        limit: u32,
        options: &DistinctValuesOptions,
    ) -> Result<Vec<(Option<T>, i64)>, QueueError> {
        let values = self
            .storage
            .distinct_values(&self.queue, field.column(), limit, options)
            .await?;
        Ok(values
            .into_iter()
            .map(|v| (v.value.as_ref().and_then(T::from_value), v.count))
            .collect())
    }
}
