//! Message lifecycle states.
//!
//! A message's state is never stored. It is derived from three columns and
//! the current time:
//!
//! | state     | processing_at | scheduled_at | remaining_attempts |
//! |-----------|---------------|--------------|--------------------|
//! | scheduled | null          | > now        | any                |
//! | ready     | null          | <= now       | > 0                |
//! | in flight | not null      | > now        | any                |
//! | retry     | not null      | <= now       | > 0                |
//! | dead      | any           | <= now       | <= 0               |
//!
//! Scheduled and in-flight rows ignore `remaining_attempts`: a row only
//! counts as dead once it is due. Every row falls into exactly one state. The SQL fragments below encode
//! the same boundaries, so counts taken in the database agree with
//! [`classify`].

use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived state of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Never delivered, waiting for its delay to pass.
    Scheduled,
    /// Never delivered, visible to consumers.
    Ready,
    /// Leased by a consumer; hidden until its visibility timeout expires.
    InFlight,
    /// Lease expired without an acknowledgment; visible again.
    Retry,
    /// Out of attempts; only the sweep touches it.
    Dead,
}

impl MessageState {
    pub const ALL: [MessageState; 5] = [
        MessageState::Scheduled,
        MessageState::Ready,
        MessageState::InFlight,
        MessageState::Retry,
        MessageState::Dead,
    ];

    /// SQL predicate selecting rows in this state, evaluated against
    /// `current_timestamp`.
    pub fn sql_predicate(&self) -> &'static str {
        match self {
            MessageState::Scheduled => SCHEDULED_PREDICATE,
            MessageState::Ready => READY_PREDICATE,
            MessageState::InFlight => IN_FLIGHT_PREDICATE,
            MessageState::Retry => RETRY_PREDICATE,
            MessageState::Dead => DEAD_PREDICATE,
        }
    }

    /// Whether a consumer may lease a message in this state.
    pub fn is_receivable(&self) -> bool {
        matches!(self, MessageState::Ready | MessageState::Retry)
    }
}

/// Deliberately without `remaining_attempts > 0`: a delayed message whose
/// attempts were set to zero (say by a mutation) is not due yet, so it is not
/// dead either, and with the extra clause it would match no state at all. It
/// turns dead once `scheduled_at` passes.
pub const SCHEDULED_PREDICATE: &str =
    "processing_at is null and scheduled_at > current_timestamp";

pub const READY_PREDICATE: &str =
    "processing_at is null and scheduled_at <= current_timestamp and remaining_attempts > 0";

pub const IN_FLIGHT_PREDICATE: &str =
    "processing_at is not null and scheduled_at > current_timestamp";

pub const RETRY_PREDICATE: &str =
    "processing_at is not null and scheduled_at <= current_timestamp and remaining_attempts > 0";

pub const DEAD_PREDICATE: &str = "scheduled_at <= current_timestamp and remaining_attempts <= 0";

/// Dead-row predicate for the sweep. Uses the wall clock rather than the
/// transaction start so a long transaction still sees rows that died in it.
pub const SWEEP_PREDICATE: &str = "remaining_attempts <= 0 and scheduled_at <= clock_timestamp()";

/// Derive the state of a message at `now`.
pub fn classify(
    processing_at: Option<DateTime<Utc>>,
    scheduled_at: DateTime<Utc>,
    remaining_attempts: i32,
    now: DateTime<Utc>,
) -> MessageState {
    let due = scheduled_at <= now;
    match (processing_at.is_some(), due, remaining_attempts > 0) {
        (_, true, false) => MessageState::Dead,
        (false, false, _) => MessageState::Scheduled,
        (true, false, _) => MessageState::InFlight,
        (false, true, true) => MessageState::Ready,
        (true, true, true) => MessageState::Retry,
    }
}

/// Number of messages per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub scheduled: i64,
    pub ready: i64,
    pub in_flight: i64,
    pub retry: i64,
    pub dead: i64,
}

impl MessageCounts {
    pub fn total(&self) -> i64 {
        self.scheduled + self.ready + self.in_flight + self.retry + self.dead
    }

    pub fn get(&self, state: MessageState) -> i64 {
        match state {
            MessageState::Scheduled => self.scheduled,
            MessageState::Ready => self.ready,
            MessageState::InFlight => self.in_flight,
            MessageState::Retry => self.retry,
            MessageState::Dead => self.dead,
        }
    }

    /// Count one more message in `state`.
    pub fn record(&mut self, state: MessageState) {
        match state {
            MessageState::Scheduled => self.scheduled += 1,
            MessageState::Ready => self.ready += 1,
            MessageState::InFlight => self.in_flight += 1,
            MessageState::Retry => self.retry += 1,
            MessageState::Dead => self.dead += 1,
        }
    }

    /// Combine counts taken from different shards or nodes.
    pub fn merge(&self, other: &MessageCounts) -> MessageCounts {
        MessageCounts {
            scheduled: self.scheduled + other.scheduled,
            ready: self.ready + other.ready,
            in_flight: self.in_flight + other.in_flight,
            retry: self.retry + other.retry,
            dead: self.dead + other.dead,
        }
    }
}

impl AddAssign for MessageCounts {
    fn add_assign(&mut self, other: MessageCounts) {
        *self = self.merge(&other);
    }
}
