use std::collections::BTreeMap;
use std::ops::Range;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::condition::{Condition, Field, MetaScalar, MetaType, MetaValue, Order};
use crate::config::QueueOptions;
use crate::error::QueueError;
use crate::types::{MessageId, QueueName, ShardNumber};

/// A meta column declared on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaColumn {
    pub column: String,
    pub meta_type: MetaType,
}

/// A queue: its table, defaults and declared meta columns.
#[derive(Debug, Clone)]
pub struct Queue {
    name: QueueName,
    options: QueueOptions,
    meta: Vec<MetaColumn>,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Result<Self, QueueError> {
        Ok(Self {
            name: QueueName::new(name)?,
            options: QueueOptions::default(),
            meta: Vec::new(),
        })
    }

    pub fn with_options(mut self, options: QueueOptions) -> Result<Self, QueueError> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    /// Declare a meta column. Messages may only carry declared columns.
    pub fn with_field<T: MetaScalar>(mut self, field: &Field<T>) -> Self {
        self.meta.retain(|m| m.column != field.column());
        self.meta.push(MetaColumn {
            column: field.column().to_owned(),
            meta_type: field.meta_type(),
        });
        self
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn table_name(&self) -> String {
        self.name.table_name()
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn meta_columns(&self) -> &[MetaColumn] {
        &self.meta
    }

    /// Check that every meta value of `message` targets a declared column of
    /// the right type.
    pub(crate) fn check_message(&self, message: &SendMessage) -> Result<(), QueueError> {
        if let Some(attempts) = message.attempts {
            if attempts < 1 {
                return Err(QueueError::invalid_config(format!(
                    "attempts must be >= 1, got {attempts}"
                )));
            }
        }
        for (column, value) in &message.meta {
            let declared = self
                .meta
                .iter()
                .find(|m| &m.column == column)
                .ok_or_else(|| {
                    QueueError::invalid_config(format!(
                        "queue {} has no meta column {column}",
                        self.name
                    ))
                })?;
            if declared.meta_type != value.meta_type() {
                return Err(QueueError::invalid_config(format!(
                    "meta column {column} of queue {} is {:?}, got {:?}",
                    self.name,
                    declared.meta_type,
                    value.meta_type()
                )));
            }
        }
        Ok(())
    }

    /// Delay applied to a message, falling back to the queue default.
    pub(crate) fn delay_for(&self, message: &SendMessage) -> Duration {
        message.delay.unwrap_or(self.options.default_delay)
    }

    /// Attempts granted to a message, falling back to the queue default.
    pub(crate) fn attempts_for(&self, message: &SendMessage) -> i32 {
        message.attempts.unwrap_or(self.options.default_attempts)
    }

    pub(crate) fn visibility_for(&self, options: &ReceiveOptions) -> Duration {
        options
            .visibility_timeout
            .unwrap_or(self.options.visibility_timeout)
    }
}

/// A message to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct SendMessage {
    pub payload: Vec<u8>,
    /// Meta values keyed by column name.
    pub meta: BTreeMap<String, MetaValue>,
    /// Overrides the queue's default delay.
    pub delay: Option<Duration>,
    /// Overrides the queue's default attempts.
    pub attempts: Option<i32>,
}

impl SendMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            meta: BTreeMap::new(),
            delay: None,
            attempts: None,
        }
    }

    pub fn with_meta<T: MetaScalar>(mut self, field: &Field<T>, value: T) -> Self {
        self.meta
            .insert(field.column().to_owned(), value.into_value());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

/// A leased message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
    /// When this lease was taken.
    pub processing_at: DateTime<Utc>,
    /// When the lease expires and the message becomes visible again.
    pub scheduled_at: DateTime<Utc>,
    /// Attempts left after this delivery.
    pub remaining_attempts: i32,
    pub payload: Vec<u8>,
    /// Non-null meta values keyed by column name.
    pub meta: BTreeMap<String, MetaValue>,
}

impl Message {
    /// Typed meta value. `None` when the column is null or holds another
    /// type.
    pub fn meta_value<T: MetaScalar>(&self, field: &Field<T>) -> Option<T> {
        self.meta.get(field.column()).and_then(T::from_value)
    }
}

/// What to receive and how long to hold it.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Maximum messages to lease. Default: 1.
    pub limit: u32,
    /// Overrides the queue's visibility timeout.
    pub visibility_timeout: Option<Duration>,
    /// Only lease messages matching this condition.
    pub filter: Option<Condition>,
    /// Ordering applied before the default `scheduled_at, created_at`.
    pub order: Vec<Order>,
    /// Only lease from these shards. `None` means every shard.
    pub shards: Option<Vec<ShardNumber>>,
}

impl ReceiveOptions {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            limit: 1,
            visibility_timeout: None,
            filter: None,
            order: Vec::new(),
            shards: None,
        }
    }
}

/// Change applied to existing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// `remaining_attempts = remaining_attempts + delta`
    AddRemainingAttempts(i32),
    /// `remaining_attempts = value`
    SetRemainingAttempts(i32),
    /// `scheduled_at = scheduled_at + delta`
    AddScheduledAt(Duration),
    /// `scheduled_at = now + delay`
    SetScheduledAt(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutatedColumn {
    RemainingAttempts,
    ScheduledAt,
}

impl Mutation {
    fn column(&self) -> MutatedColumn {
        match self {
            Mutation::AddRemainingAttempts(_) | Mutation::SetRemainingAttempts(_) => {
                MutatedColumn::RemainingAttempts
            }
            Mutation::AddScheduledAt(_) | Mutation::SetScheduledAt(_) => MutatedColumn::ScheduledAt,
        }
    }

    /// Reject empty lists and lists touching one column twice.
    pub fn validate_all(mutations: &[Mutation]) -> Result<(), QueueError> {
        if mutations.is_empty() {
            return Err(QueueError::invalid_config("mutation list is empty"));
        }
        for (i, mutation) in mutations.iter().enumerate() {
            if mutations[..i].iter().any(|m| m.column() == mutation.column()) {
                return Err(QueueError::invalid_config(format!(
                    "more than one mutation of the same column: {mutations:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a mutation for one message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageResult {
    Mutated {
        id: MessageId,
        scheduled_at: DateTime<Utc>,
        remaining_attempts: i32,
    },
    /// The message was gone, most likely consumed or swept meanwhile.
    NotFound { id: MessageId },
}

/// Per-id results of a mutation, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MutateResult {
    pub messages: Vec<MessageResult>,
}

impl MutateResult {
    pub fn mutated(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| matches!(m, MessageResult::Mutated { .. }))
            .count()
    }

    pub fn not_found(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                MessageResult::NotFound { id } => Some(*id),
                MessageResult::Mutated { .. } => None,
            })
            .collect()
    }
}

/// A chunk of a batched send that was not written.
#[derive(Debug)]
pub struct SendFailure {
    /// Positions of the failed messages in the request.
    pub messages: Range<usize>,
    pub error: QueueError,
}

/// Outcome of a batched send.
#[derive(Debug, Default)]
pub struct SendResult {
    /// One entry per requested message, in request order; `None` when the
    /// message was not written.
    pub ids: Vec<Option<MessageId>>,
    pub failures: Vec<SendFailure>,
}

impl SendResult {
    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            ids: vec![None; len],
            failures: Vec::new(),
        }
    }

    /// Every message failed with `error`.
    pub(crate) fn all_failed(len: usize, error: QueueError) -> Self {
        let mut result = Self::with_len(len);
        result.record_failed(0..len, error);
        result
    }

    pub(crate) fn record_sent(&mut self, start: usize, ids: impl IntoIterator<Item = MessageId>) {
        for (slot, id) in self.ids[start..].iter_mut().zip(ids) {
            *slot = Some(id);
        }
    }

    pub(crate) fn record_failed(&mut self, messages: Range<usize>, error: QueueError) {
        tracing::debug!(
            failed = messages.len(),
            first = messages.start,
            error = %error,
            "send chunk failed"
        );
        self.failures.push(SendFailure { messages, error });
    }

    pub fn failed_messages(&self) -> usize {
        self.failures.iter().map(|f| f.messages.len()).sum()
    }

    /// Ids of the written messages, in request order.
    pub fn sent(&self) -> Vec<MessageId> {
        self.ids.iter().flatten().copied().collect()
    }

    /// Request positions of every failed message, e.g. to resend them.
    pub fn failed_indexes(&self) -> Vec<usize> {
        self.failures
            .iter()
            .flat_map(|f| f.messages.clone())
            .collect()
    }

    /// All ids if nothing failed, otherwise the first failure's error.
    pub fn into_result(self) -> Result<Vec<MessageId>, QueueError> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(self.ids.into_iter().flatten().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (Queue, Field<i64>, Field<String>) {
        let user = Field::<i64>::new("user_id").unwrap();
        let key = Field::<String>::new("key").unwrap();
        let queue = Queue::new("orders")
            .unwrap()
            .with_field(&user)
            .with_field(&key);
        (queue, user, key)
    }

    #[test]
    fn declared_meta_is_accepted() {
        let (queue, user, key) = queue();
        let message = SendMessage::new(b"x".to_vec())
            .with_meta(&user, 7)
            .with_meta(&key, "k".to_owned());
        queue.check_message(&message).unwrap();
    }

    #[test]
    fn undeclared_or_mistyped_meta_is_rejected() {
        let (queue, _, _) = queue();
        let other = Field::<i64>::new("other").unwrap();
        let message = SendMessage::new(b"x".to_vec()).with_meta(&other, 1);
        assert!(queue.check_message(&message).is_err());

        let mistyped = Field::<i32>::new("user_id").unwrap();
        let message = SendMessage::new(b"x".to_vec()).with_meta(&mistyped, 1);
        let err = queue.check_message(&message).unwrap_err().to_string();
        assert!(err.contains("meta_user_id"), "got: {err}");
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let (queue, _, _) = queue();
        let message = SendMessage::new(b"x".to_vec()).with_attempts(0);
        assert!(queue.check_message(&message).is_err());
    }

    #[test]
    fn defaults_come_from_queue_options() {
        let queue = Queue::new("mail")
            .unwrap()
            .with_options(QueueOptions {
                default_attempts: 3,
                default_delay: Duration::from_secs(10),
                visibility_timeout: Duration::from_secs(30),
            })
            .unwrap();
        let plain = SendMessage::new(Vec::new());
        assert_eq!(queue.attempts_for(&plain), 3);
        assert_eq!(queue.delay_for(&plain), Duration::from_secs(10));
        let custom = SendMessage::new(Vec::new())
            .with_attempts(9)
            .with_delay(Duration::ZERO);
        assert_eq!(queue.attempts_for(&custom), 9);
        assert_eq!(queue.delay_for(&custom), Duration::ZERO);
        assert_eq!(
            queue.visibility_for(&ReceiveOptions::default()),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn one_mutation_per_column() {
        Mutation::validate_all(&[
            Mutation::AddRemainingAttempts(1),
            Mutation::SetScheduledAt(Duration::ZERO),
        ])
        .unwrap();
        assert!(Mutation::validate_all(&[]).is_err());
        assert!(Mutation::validate_all(&[
            Mutation::AddRemainingAttempts(1),
            Mutation::SetRemainingAttempts(0),
        ])
        .is_err());
        assert!(Mutation::validate_all(&[
            Mutation::AddScheduledAt(Duration::from_secs(1)),
            Mutation::SetScheduledAt(Duration::ZERO),
        ])
        .is_err());
    }

    #[test]
    fn meta_value_is_typed_by_the_field() {
        let (_, user, key) = queue();
        let now = Utc::now();
        let mut meta = BTreeMap::new();
        meta.insert(user.column().to_owned(), MetaValue::BigInt(42));
        let message = Message {
            id: MessageId::new(1, ShardNumber::new_unchecked(1)),
            created_at: now,
            processing_at: now,
            scheduled_at: now,
            remaining_attempts: 1,
            payload: Vec::new(),
            meta,
        };
        assert_eq!(message.meta_value(&user), Some(42_i64));
        assert_eq!(message.meta_value(&key), None);
        // Same column name, different declared type.
        let narrow = Field::<i32>::new("user_id").unwrap();
        assert_eq!(message.meta_value(&narrow), None);
    }

    #[test]
    fn send_result_tracks_failed_positions() {
        let id = |n| MessageId::new(n, ShardNumber::new_unchecked(3));
        let mut result = SendResult::with_len(6);
        result.record_sent(0, [id(1), id(2)]);
        result.record_failed(2..4, QueueError::invalid_config("bad chunk"));
        result.record_sent(4, [id(3), id(4)]);

        assert_eq!(result.failed_messages(), 2);
        assert_eq!(result.failed_indexes(), vec![2, 3]);
        assert_eq!(result.sent(), vec![id(1), id(2), id(3), id(4)]);
        assert_eq!(result.ids[2], None);
        let err = result.into_result().unwrap_err();
        assert!(err.to_string().contains("bad chunk"));

        let all = SendResult::all_failed(3, QueueError::invalid_config("nope"));
        assert_eq!(all.failed_indexes(), vec![0, 1, 2]);
        assert!(all.sent().is_empty());
    }

    #[test]
    fn mutate_result_helpers() {
        let a = MessageId::new(1, ShardNumber::new_unchecked(1));
        let b = MessageId::new(2, ShardNumber::new_unchecked(1));
        let result = MutateResult {
            messages: vec![
                MessageResult::Mutated {
                    id: a,
                    scheduled_at: Utc::now(),
                    remaining_attempts: 2,
                },
                MessageResult::NotFound { id: b },
            ],
        };
        assert_eq!(result.mutated(), 1);
        assert_eq!(result.not_found(), vec![b]);
    }
}
