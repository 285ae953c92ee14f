use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::condition::{Condition, MetaValue};
use crate::config::{PartialInsert, SendOptions};
use crate::error::QueueError;
use crate::identifier::{IdLayout, LocalSequence};
use crate::inspect::{declared_column, DistinctValue, DistinctValuesOptions, MessageAge};
use crate::lifecycle::{classify, MessageCounts, MessageState};
use crate::lock::AdvisoryLockSession;
use crate::queue::{
    Message, MessageResult, MutateResult, Mutation, Queue, ReceiveOptions, SendMessage, SendResult,
};
use crate::queue_storage::QueueStorage;
use crate::storage::memory_lock::{MemoryAdvisoryLocks, MemoryLockSession};
use crate::sweep::{SweepEngine, SweepOutcome, SweepTarget};
use crate::types::{Bucket, MessageId, QueueName, ShardNumber};

/// In-memory queue storage for testing.
///
/// Time is the wall clock plus an offset that tests move forward with
/// [`advance_clock`](Self::advance_clock), so visibility timeouts and delays
/// can expire without sleeping.
pub struct MemoryQueueStorage {
    shared: Arc<Shared>,
    sweep: SweepEngine,
}

/// State shared by every storage attached to the same "database".
struct Shared {
    layout: IdLayout,
    bucket: Bucket,
    tables: Mutex<Tables>,
    locks: MemoryAdvisoryLocks,
}

#[derive(Default)]
struct Tables {
    queues: HashMap<String, Table>,
    clock_offset: chrono::Duration,
}

impl Tables {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }
}

struct Table {
    sequence: LocalSequence,
    rows: BTreeMap<i64, StoredMessage>,
}

#[derive(Clone)]
struct StoredMessage {
    shard: ShardNumber,
    created_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    processing_at: Option<DateTime<Utc>>,
    remaining_attempts: i32,
    payload: Vec<u8>,
    meta: BTreeMap<String, MetaValue>,
}

impl StoredMessage {
    fn state(&self, now: DateTime<Utc>) -> MessageState {
        classify(
            self.processing_at,
            self.scheduled_at,
            self.remaining_attempts,
            now,
        )
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, QueueError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| QueueError::invalid_config(format!("duration {duration:?} is out of range: {e}")))
}

/// Validate one chunk and mint its ids. Nothing is inserted.
fn stage_chunk(
    queue: &Queue,
    table: &mut Table,
    shard: ShardNumber,
    now: DateTime<Utc>,
    chunk: &[SendMessage],
) -> Result<Vec<(i64, StoredMessage)>, QueueError> {
    let mut pending = Vec::with_capacity(chunk.len());
    for message in chunk {
        queue.check_message(message)?;
        pending.push((to_chrono(queue.delay_for(message))?, message));
    }
    let mut rows = Vec::with_capacity(pending.len());
    for (delay, message) in pending {
        rows.push((
            table.sequence.next_id()?,
            StoredMessage {
                shard,
                created_at: now,
                scheduled_at: now + delay,
                processing_at: None,
                remaining_attempts: queue.attempts_for(message),
                payload: message.payload.clone(),
                meta: message.meta.clone(),
            },
        ));
    }
    Ok(rows)
}

fn age_since(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                layout: IdLayout::default(),
                bucket: Bucket::new_unchecked(0),
                tables: Mutex::new(Tables::default()),
                locks: MemoryAdvisoryLocks::new(),
            }),
            sweep: SweepEngine::with_defaults(),
        }
    }

    /// Mint ids from `bucket` instead of bucket 0.
    pub fn with_identifiers(layout: IdLayout, bucket: Bucket) -> Result<Self, QueueError> {
        layout.encode(bucket, 0)?;
        Ok(Self {
            shared: Arc::new(Shared {
                layout,
                bucket,
                tables: Mutex::new(Tables::default()),
                locks: MemoryAdvisoryLocks::new(),
            }),
            sweep: SweepEngine::with_defaults(),
        })
    }

    pub fn with_sweep(mut self, sweep: SweepEngine) -> Self {
        self.sweep = sweep;
        self
    }

    /// Another handle on the same tables and advisory locks, standing in
    /// for a second process connected to the same database.
    pub fn attach(&self, sweep: SweepEngine) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            sweep,
        }
    }

    pub fn sweep_engine(&self) -> &SweepEngine {
        &self.sweep
    }

    /// The advisory locks of this "database".
    pub fn advisory_locks(&self) -> &MemoryAdvisoryLocks {
        &self.shared.locks
    }

    /// Move the storage clock forward.
    pub fn advance_clock(&self, by: chrono::Duration) {
        self.shared.tables.lock().clock_offset += by;
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.shared.tables.lock().now()
    }

    /// Number of rows in the queue table, whatever their state.
    pub fn row_count(&self, queue: &Queue) -> usize {
        self.shared
            .tables
            .lock()
            .queues
            .get(&queue.table_name())
            .map_or(0, |table| table.rows.len())
    }

    fn session(&self) -> MemorySweepSession<'_> {
        MemorySweepSession {
            tables: &self.shared.tables,
            lock: self.shared.locks.session(),
        }
    }

    fn table_mut<'t>(&self, tables: &'t mut Tables, queue: &Queue) -> Result<&'t mut Table, QueueError> {
        match tables.queues.entry(queue.table_name()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(Table {
                sequence: LocalSequence::new(self.shared.layout, self.shared.bucket)?,
                rows: BTreeMap::new(),
            })),
        }
    }
}

impl Default for MemoryQueueStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn send_batched(
        &self,
        queue: &Queue,
        shard: ShardNumber,
        messages: &[SendMessage],
        options: &SendOptions,
    ) -> Result<SendResult, QueueError> {
        options.validate()?;
        let mut result = SendResult::with_len(messages.len());
        if messages.is_empty() {
            return Ok(result);
        }

        let mut tables = self.shared.tables.lock();
        let now = tables.now();
        let table = self.table_mut(&mut tables, queue)?;

        // Rows are staged and only become visible once every chunk has been
        // dealt with, like a transaction commit.
        let mut staged = Vec::with_capacity(messages.len());
        for (chunk_index, chunk) in messages.chunks(options.batch_size).enumerate() {
            let start = chunk_index * options.batch_size;
            match stage_chunk(queue, table, shard, now, chunk) {
                Ok(rows) => {
                    result.record_sent(start, rows.iter().map(|(id, _)| MessageId::new(*id, shard)));
                    staged.extend(rows);
                }
                Err(error) => match options.partial_insert {
                    PartialInsert::Prohibited => {
                        return Ok(SendResult::all_failed(messages.len(), error));
                    }
                    PartialInsert::UntilFirstFailure => {
                        result.record_failed(start..messages.len(), error);
                        break;
                    }
                    PartialInsert::InsertAsManyAsPossible => {
                        result.record_failed(start..start + chunk.len(), error);
                    }
                },
            }
        }
        table.rows.extend(staged);
        Ok(result)
    }

    async fn receive(
        &self,
        queue: &Queue,
        options: &ReceiveOptions,
    ) -> Result<Vec<Message>, QueueError> {
        if options.limit == 0 {
            return Err(QueueError::invalid_config("receive limit must be >= 1"));
        }
        let visibility = to_chrono(queue.visibility_for(options))?;

        {
            let mut session = self.session();
            self.sweep
                .maybe_sweep(&mut session, queue.name(), options.limit)
                .await;
        }

        let mut tables = self.shared.tables.lock();
        let now = tables.now();
        let Some(table) = tables.queues.get_mut(&queue.table_name()) else {
            return Ok(Vec::new());
        };

        let mut candidates = Vec::new();
        for (id, row) in &table.rows {
            if !row.state(now).is_receivable() {
                continue;
            }
            if let Some(shards) = &options.shards {
                if !shards.contains(&row.shard) {
                    continue;
                }
            }
            if let Some(filter) = &options.filter {
                if !filter.matches(&row.meta)? {
                    continue;
                }
            }
            candidates.push(*id);
        }
        candidates.sort_by(|a, b| {
            let (left, right) = (&table.rows[a], &table.rows[b]);
            options
                .order
                .iter()
                .map(|order| order.compare(&left.meta, &right.meta))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(left.scheduled_at.cmp(&right.scheduled_at))
                .then(left.created_at.cmp(&right.created_at))
                .then(a.cmp(b))
        });
        candidates.truncate(options.limit as usize);

        let mut leased = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(row) = table.rows.get_mut(&id) else {
                continue;
            };
            row.processing_at = Some(now);
            row.scheduled_at = now + visibility;
            row.remaining_attempts -= 1;
            leased.push(Message {
                id: MessageId::new(id, row.shard),
                created_at: row.created_at,
                processing_at: now,
                scheduled_at: row.scheduled_at,
                remaining_attempts: row.remaining_attempts,
                payload: row.payload.clone(),
                meta: row.meta.clone(),
            });
        }
        Ok(leased)
    }

    async fn delete(&self, queue: &Queue, ids: &[MessageId]) -> Result<u64, QueueError> {
        let mut tables = self.shared.tables.lock();
        let Some(table) = tables.queues.get_mut(&queue.table_name()) else {
            return Ok(0);
        };
        let mut removed = 0;
        for id in ids {
            if table.rows.get(&id.local_id).is_some_and(|row| row.shard == id.shard) {
                table.rows.remove(&id.local_id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn mutate(
        &self,
        queue: &Queue,
        mutations: &[Mutation],
        ids: &[MessageId],
    ) -> Result<MutateResult, QueueError> {
        Mutation::validate_all(mutations)?;
        let mut changes = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            changes.push(match *mutation {
                Mutation::AddScheduledAt(delta) => (mutation, Some(to_chrono(delta)?)),
                Mutation::SetScheduledAt(delay) => (mutation, Some(to_chrono(delay)?)),
                _ => (mutation, None),
            });
        }

        let mut tables = self.shared.tables.lock();
        let now = tables.now();
        let table = tables.queues.get_mut(&queue.table_name());
        let mut result = MutateResult::default();
        let Some(table) = table else {
            result.messages = ids.iter().map(|id| MessageResult::NotFound { id: *id }).collect();
            return Ok(result);
        };

        for id in ids {
            let row = match table.rows.get_mut(&id.local_id) {
                Some(row) if row.shard == id.shard => row,
                _ => {
                    result.messages.push(MessageResult::NotFound { id: *id });
                    continue;
                }
            };
            for (mutation, duration) in &changes {
                match (mutation, duration) {
                    (Mutation::AddRemainingAttempts(delta), _) => {
                        row.remaining_attempts = row.remaining_attempts.saturating_add(*delta);
                    }
                    (Mutation::SetRemainingAttempts(value), _) => {
                        row.remaining_attempts = *value;
                    }
                    (Mutation::AddScheduledAt(_), Some(delta)) => {
                        row.scheduled_at += *delta;
                    }
                    (Mutation::SetScheduledAt(_), Some(delay)) => {
                        row.scheduled_at = now + *delay;
                    }
                    _ => {}
                }
            }
            result.messages.push(MessageResult::Mutated {
                id: *id,
                scheduled_at: row.scheduled_at,
                remaining_attempts: row.remaining_attempts,
            });
        }
        Ok(result)
    }

    async fn count(
        &self,
        queue: &Queue,
        filter: Option<&Condition>,
    ) -> Result<MessageCounts, QueueError> {
        let tables = self.shared.tables.lock();
        let now = tables.now();
        let mut counts = MessageCounts::default();
        let Some(table) = tables.queues.get(&queue.table_name()) else {
            return Ok(counts);
        };
        for row in table.rows.values() {
            if let Some(filter) = filter {
                if !filter.matches(&row.meta)? {
                    continue;
                }
            }
            counts.record(row.state(now));
        }
        Ok(counts)
    }

    async fn is_empty(&self, queue: &Queue) -> Result<bool, QueueError> {
        Ok(self.row_count(queue) == 0)
    }

    async fn is_dead_or_empty(&self, queue: &Queue) -> Result<bool, QueueError> {
        let tables = self.shared.tables.lock();
        let now = tables.now();
        Ok(tables
            .queues
            .get(&queue.table_name())
            .map_or(true, |table| {
                table
                    .rows
                    .values()
                    .all(|row| row.state(now) == MessageState::Dead)
            }))
    }

    async fn message_age(&self, queue: &Queue) -> Result<MessageAge, QueueError> {
        let tables = self.shared.tables.lock();
        let now = tables.now();
        let Some(table) = tables.queues.get(&queue.table_name()) else {
            return Ok(MessageAge::default());
        };
        let oldest_ready = table
            .rows
            .values()
            .filter(|row| row.state(now).is_receivable())
            .map(|row| row.scheduled_at)
            .min();
        Ok(MessageAge {
            oldest: table.rows.values().next().map(|row| age_since(now, row.created_at)),
            newest: table
                .rows
                .values()
                .next_back()
                .map(|row| age_since(now, row.created_at)),
            oldest_ready: oldest_ready.map(|due| age_since(now, due)),
        })
    }

    /// Exact counts; the sample size is ignored.
    async fn distinct_values(
        &self,
        queue: &Queue,
        column: &str,
        limit: u32,
        options: &DistinctValuesOptions,
    ) -> Result<Vec<DistinctValue>, QueueError> {
        declared_column(queue, column)?;
        options.validate()?;
        if limit == 0 {
            return Err(QueueError::invalid_config("distinct values limit must be >= 1"));
        }

        let tables = self.shared.tables.lock();
        let Some(table) = tables.queues.get(&queue.table_name()) else {
            return Ok(Vec::new());
        };
        // MetaValue is not hashable (floats), so group linearly in id order.
        let mut groups: Vec<DistinctValue> = Vec::new();
        for row in table.rows.values() {
            if let Some(filter) = &options.filter {
                if !filter.matches(&row.meta)? {
                    continue;
                }
            }
            let value = row.meta.get(column);
            match groups.iter_mut().find(|g| g.value.as_ref() == value) {
                Some(group) => group.count += 1,
                None => groups.push(DistinctValue {
                    value: value.cloned(),
                    count: 1,
                }),
            }
        }
        if let Some(order) = options.order {
            if order.descending() {
                groups.sort_by(|a, b| b.count.cmp(&a.count));
            } else {
                groups.sort_by(|a, b| a.count.cmp(&b.count));
            }
        }
        groups.truncate(limit as usize);
        Ok(groups)
    }

    async fn sweep(&self, queue: &Queue, limit_hint: u32) -> Result<SweepOutcome, QueueError> {
        let mut session = self.session();
        self.sweep.sweep(&mut session, queue.name(), limit_hint).await
    }
}

/// One "connection" used for sweeping: an advisory lock session plus access
/// to the tables.
struct MemorySweepSession<'a> {
    tables: &'a Mutex<Tables>,
    lock: MemoryLockSession,
}

#[async_trait]
impl AdvisoryLockSession for MemorySweepSession<'_> {
    async fn try_advisory_lock(&mut self, lock_id: i64) -> Result<bool, QueueError> {
        self.lock.try_advisory_lock(lock_id).await
    }

    async fn advisory_unlock(&mut self, lock_id: i64) -> Result<bool, QueueError> {
        self.lock.advisory_unlock(lock_id).await
    }

    fn abandon_advisory_lock(&mut self, lock_id: i64) {
        self.lock.abandon_advisory_lock(lock_id);
    }
}

#[async_trait]
impl SweepTarget for MemorySweepSession<'_> {
    async fn delete_dead_messages(
        &mut self,
        queue: &QueueName,
        max_rows: u32,
    ) -> Result<u64, QueueError> {
        let mut tables = self.tables.lock();
        let now = tables.now();
        let Some(table) = tables.queues.get_mut(&queue.table_name()) else {
            return Ok(0);
        };
        let dead: Vec<i64> = table
            .rows
            .iter()
            .filter(|(_, row)| row.remaining_attempts <= 0 && row.scheduled_at <= now)
            .map(|(id, _)| *id)
            .take(max_rows as usize)
            .collect();
        for id in &dead {
            table.rows.remove(id);
        }
        Ok(dead.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Field, SortOrder};
    use crate::config::SweepConfig;
    use crate::lock::LockManager;

    fn shard(n: i32) -> ShardNumber {
        ShardNumber::new_unchecked(n)
    }

    fn no_sweep() -> SweepEngine {
        SweepEngine::new(SweepConfig::disabled(), Arc::new(LockManager::new())).unwrap()
    }

    fn storage() -> MemoryQueueStorage {
        MemoryQueueStorage::new().with_sweep(no_sweep())
    }

    fn queue() -> Queue {
        Queue::new("jobs").unwrap()
    }

    fn payloads(messages: &[Message]) -> Vec<Vec<u8>> {
        messages.iter().map(|m| m.payload.clone()).collect()
    }

    #[tokio::test]
    async fn ids_increase_in_send_order() {
        let storage = storage();
        let ids = storage
            .send(
                &queue(),
                shard(3),
                &[SendMessage::new(b"a".to_vec()), SendMessage::new(b"b".to_vec())],
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0].local_id < ids[1].local_id);
        assert!(ids.iter().all(|id| id.shard == shard(3)));
    }

    #[tokio::test]
    async fn bucket_is_encoded_in_ids() {
        let layout = IdLayout::default();
        let bucket = Bucket::new_unchecked(5);
        let storage = MemoryQueueStorage::with_identifiers(layout, bucket)
            .unwrap()
            .with_sweep(no_sweep());
        let ids = storage
            .send(&queue(), shard(1), &[SendMessage::new(Vec::new())])
            .await
            .unwrap();
        assert_eq!(layout.decode(ids[0].local_id).unwrap().bucket, bucket);
    }

    #[tokio::test]
    async fn receive_leases_and_hides() {
        let storage = storage();
        let queue = queue();
        storage
            .send(&queue, shard(1), &[SendMessage::new(b"x".to_vec()).with_attempts(2)])
            .await
            .unwrap();

        let leased = storage.receive(&queue, &ReceiveOptions::default()).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].remaining_attempts, 1);
        assert_eq!(
            leased[0].scheduled_at - leased[0].processing_at,
            chrono::Duration::seconds(60)
        );

        // Hidden while in flight.
        assert!(storage.receive(&queue, &ReceiveOptions::default()).await.unwrap().is_empty());
        let counts = storage.count(&queue, None).await.unwrap();
        assert_eq!(counts.in_flight, 1);

        // Visible again once the lease expires.
        storage.advance_clock(chrono::Duration::seconds(61));
        assert_eq!(storage.count(&queue, None).await.unwrap().retry, 1);
        let again = storage.receive(&queue, &ReceiveOptions::default()).await.unwrap();
        assert_eq!(again[0].remaining_attempts, 0);

        // Out of attempts: dead after the last lease expires.
        storage.advance_clock(chrono::Duration::seconds(61));
        assert!(storage.receive(&queue, &ReceiveOptions::default()).await.unwrap().is_empty());
        assert_eq!(storage.count(&queue, None).await.unwrap().dead, 1);
        assert!(storage.is_dead_or_empty(&queue).await.unwrap());
        assert!(!storage.is_empty(&queue).await.unwrap());
    }

    #[tokio::test]
    async fn delay_schedules_message() {
        let storage = storage();
        let queue = queue();
        storage
            .send(
                &queue,
                shard(1),
                &[SendMessage::new(Vec::new()).with_delay(Duration::from_secs(30))],
            )
            .await
            .unwrap();
        assert_eq!(storage.count(&queue, None).await.unwrap().scheduled, 1);
        assert!(storage.receive(&queue, &ReceiveOptions::default()).await.unwrap().is_empty());

        storage.advance_clock(chrono::Duration::seconds(30));
        assert_eq!(storage.count(&queue, None).await.unwrap().ready, 1);
        assert_eq!(storage.receive(&queue, &ReceiveOptions::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn receive_honours_filter_order_and_shards() {
        let storage = storage();
        let priority = Field::<i32>::new("priority").unwrap();
        let queue = queue().with_field(&priority);
        for (shard_no, p, body) in [(1, 1, "low"), (1, 9, "high"), (2, 5, "mid"), (2, 7, "other")] {
            storage
                .send(
                    &queue,
                    shard(shard_no),
                    &[SendMessage::new(body.as_bytes().to_vec()).with_meta(&priority, p)],
                )
                .await
                .unwrap();
        }

        let options = ReceiveOptions {
            limit: 10,
            filter: Some(priority.greater_eq(5)),
            order: vec![priority.desc()],
            shards: Some(vec![shard(1), shard(2)]),
            ..Default::default()
        };
        let leased = storage.receive(&queue, &options).await.unwrap();
        assert_eq!(
            payloads(&leased),
            vec![b"high".to_vec(), b"other".to_vec(), b"mid".to_vec()]
        );

        storage.advance_clock(chrono::Duration::seconds(120));
        let only_shard_two = ReceiveOptions {
            limit: 10,
            shards: Some(vec![shard(2)]),
            ..Default::default()
        };
        let leased = storage.receive(&queue, &only_shard_two).await.unwrap();
        assert_eq!(leased.len(), 2);
        assert!(leased.iter().all(|m| m.id.shard == shard(2)));
    }

    #[tokio::test]
    async fn native_filter_is_rejected() {
        let storage = storage();
        let queue = queue();
        storage
            .send(&queue, shard(1), &[SendMessage::new(Vec::new())])
            .await
            .unwrap();
        let options = ReceiveOptions {
            filter: Some(Condition::native("{0} > 1", &["x"]).unwrap()),
            ..Default::default()
        };
        assert!(storage.receive(&queue, &options).await.is_err());
    }

    #[tokio::test]
    async fn delete_counts_only_present_rows() {
        let storage = storage();
        let queue = queue();
        let ids = storage
            .send(
                &queue,
                shard(4),
                &[SendMessage::new(Vec::new()), SendMessage::new(Vec::new())],
            )
            .await
            .unwrap();

        // Right local id, wrong shard.
        let wrong = MessageId::new(ids[0].local_id, shard(5));
        assert_eq!(storage.delete(&queue, &[wrong]).await.unwrap(), 0);

        assert_eq!(storage.delete(&queue, &ids).await.unwrap(), 2);
        assert_eq!(storage.delete(&queue, &ids).await.unwrap(), 0);
        assert!(storage.is_empty(&queue).await.unwrap());
    }

    #[tokio::test]
    async fn mutate_reports_per_id() {
        let storage = storage();
        let queue = queue();
        let ids = storage
            .send(&queue, shard(1), &[SendMessage::new(Vec::new()).with_attempts(3)])
            .await
            .unwrap();
        let missing = MessageId::new(ids[0].local_id + 100, shard(1));

        let result = storage
            .mutate(
                &queue,
                &[
                    Mutation::AddRemainingAttempts(2),
                    Mutation::SetScheduledAt(Duration::from_secs(10)),
                ],
                &[ids[0], missing],
            )
            .await
            .unwrap();
        assert_eq!(result.mutated(), 1);
        assert_eq!(result.not_found(), vec![missing]);
        match &result.messages[0] {
            MessageResult::Mutated {
                remaining_attempts, ..
            } => assert_eq!(*remaining_attempts, 5),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(storage.count(&queue, None).await.unwrap().scheduled, 1);

        let err = storage
            .mutate(
                &queue,
                &[Mutation::SetRemainingAttempts(0), Mutation::AddRemainingAttempts(1)],
                &ids,
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn count_with_filter() {
        let storage = storage();
        let kind = Field::<String>::new("kind").unwrap();
        let queue = queue().with_field(&kind);
        storage
            .send(
                &queue,
                shard(1),
                &[
                    SendMessage::new(Vec::new()).with_meta(&kind, "a".to_owned()),
                    SendMessage::new(Vec::new()).with_meta(&kind, "b".to_owned()),
                    SendMessage::new(Vec::new()),
                ],
            )
            .await
            .unwrap();
        let counts = storage
            .count(&queue, Some(&kind.eq("a".to_owned())))
            .await
            .unwrap();
        assert_eq!(counts.total(), 1);
        let counts = storage.count(&queue, Some(&kind.is_null())).await.unwrap();
        assert_eq!(counts.ready, 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_dead_rows() {
        let storage = storage();
        let queue = queue();
        let ids = storage
            .send(
                &queue,
                shard(1),
                &[SendMessage::new(Vec::new()), SendMessage::new(Vec::new())],
            )
            .await
            .unwrap();
        storage
            .mutate(&queue, &[Mutation::SetRemainingAttempts(0)], &ids[..1])
            .await
            .unwrap();

        let outcome = storage.sweep(&queue, 0).await.unwrap();
        assert_eq!(outcome.removed(), 1);
        assert_eq!(storage.row_count(&queue), 1);
        assert!(!storage.advisory_locks().is_held(storage.sweep_engine().lock_id(queue.name())));
    }

    #[tokio::test]
    async fn receive_sweeps_inline_when_drawn() {
        let always = SweepEngine::new(
            SweepConfig {
                probability: 100.0,
                ..Default::default()
            },
            Arc::new(LockManager::new()),
        )
        .unwrap();
        let storage = MemoryQueueStorage::new().with_sweep(always);
        let queue = queue();
        let ids = storage
            .send(
                &queue,
                shard(1),
                &[SendMessage::new(Vec::new()), SendMessage::new(Vec::new())],
            )
            .await
            .unwrap();
        storage
            .mutate(&queue, &[Mutation::SetRemainingAttempts(0)], &ids)
            .await
            .unwrap();
        assert_eq!(storage.row_count(&queue), 2);

        assert!(storage.receive(&queue, &ReceiveOptions::default()).await.unwrap().is_empty());
        assert_eq!(storage.row_count(&queue), 0);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_writing() {
        let storage = storage();
        let queue = queue();
        let undeclared = Field::<i64>::new("nope").unwrap();
        let batch = [
            SendMessage::new(Vec::new()),
            SendMessage::new(Vec::new()).with_meta(&undeclared, 1),
        ];
        assert!(storage.send(&queue, shard(1), &batch).await.is_err());
        assert_eq!(storage.row_count(&queue), 0);

        assert!(storage
            .receive(&queue, &ReceiveOptions::with_limit(0))
            .await
            .is_err());
    }

    fn batch_with_bad_fourth() -> Vec<SendMessage> {
        (0..7)
            .map(|i| {
                let message = SendMessage::new(vec![i as u8]);
                if i == 3 {
                    message.with_attempts(0)
                } else {
                    message
                }
            })
            .collect()
    }

    async fn send_in_pairs(
        storage: &MemoryQueueStorage,
        queue: &Queue,
        partial_insert: PartialInsert,
    ) -> SendResult {
        let options = SendOptions {
            batch_size: 2,
            partial_insert,
        };
        storage
            .send_batched(queue, shard(1), &batch_with_bad_fourth(), &options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn prohibited_partial_insert_writes_nothing() {
        let storage = storage();
        let queue = queue();
        let result = send_in_pairs(&storage, &queue, PartialInsert::Prohibited).await;
        assert_eq!(result.failed_messages(), 7);
        assert!(result.sent().is_empty());
        assert_eq!(storage.row_count(&queue), 0);
    }

    #[tokio::test]
    async fn until_first_failure_keeps_earlier_chunks() {
        let storage = storage();
        let queue = queue();
        let result = send_in_pairs(&storage, &queue, PartialInsert::UntilFirstFailure).await;
        assert_eq!(result.sent().len(), 2);
        assert_eq!(result.failed_indexes(), vec![2, 3, 4, 5, 6]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(storage.row_count(&queue), 2);
    }

    #[tokio::test]
    async fn as_many_as_possible_skips_only_the_bad_chunk() {
        let storage = storage();
        let queue = queue();
        let result = send_in_pairs(&storage, &queue, PartialInsert::InsertAsManyAsPossible).await;
        assert_eq!(result.failed_indexes(), vec![2, 3]);
        assert_eq!(result.sent().len(), 5);
        assert!(result.ids[4].is_some() && result.ids[2].is_none());
        assert_eq!(storage.row_count(&queue), 5);

        let leased = storage
            .receive(&queue, &ReceiveOptions::with_limit(10))
            .await
            .unwrap();
        assert_eq!(payloads(&leased), vec![vec![0], vec![1], vec![4], vec![5], vec![6]]);
    }

    #[tokio::test]
    async fn message_age_tracks_created_and_due_times() {
        let storage = storage();
        let queue = queue();
        assert_eq!(storage.message_age(&queue).await.unwrap(), MessageAge::default());

        storage
            .send(&queue, shard(1), &[SendMessage::new(b"first".to_vec())])
            .await
            .unwrap();
        storage.advance_clock(chrono::Duration::seconds(10));
        storage
            .send(
                &queue,
                shard(1),
                &[SendMessage::new(b"later".to_vec()).with_delay(Duration::from_secs(60))],
            )
            .await
            .unwrap();
        storage.advance_clock(chrono::Duration::seconds(5));

        let within = |age: Option<Duration>, secs: u64| {
            let age = age.unwrap();
            age >= Duration::from_secs(secs) && age < Duration::from_secs(secs + 1)
        };
        let age = storage.message_age(&queue).await.unwrap();
        assert!(within(age.oldest, 15), "{age:?}");
        assert!(within(age.newest, 5), "{age:?}");
        assert!(within(age.oldest_ready, 15), "{age:?}");

        // Leasing the only due message leaves nothing ready.
        storage.receive(&queue, &ReceiveOptions::default()).await.unwrap();
        let age = storage.message_age(&queue).await.unwrap();
        assert_eq!(age.oldest_ready, None);
        assert!(age.oldest.is_some());
    }

    #[tokio::test]
    async fn distinct_values_group_filter_and_sort() {
        let storage = storage();
        let region = Field::<String>::new("region").unwrap();
        let urgent = Field::<bool>::new("urgent").unwrap();
        let queue = queue().with_field(&region).with_field(&urgent);
        let message = |r: Option<&str>, u: bool| {
            let message = SendMessage::new(Vec::new()).with_meta(&urgent, u);
            match r {
                Some(r) => message.with_meta(&region, r.to_owned()),
                None => message,
            }
        };
        storage
            .send(
                &queue,
                shard(1),
                &[
                    message(Some("us"), false),
                    message(Some("eu"), true),
                    message(None, false),
                    message(Some("eu"), false),
                    message(None, true),
                    message(Some("eu"), true),
                ],
            )
            .await
            .unwrap();

        let by_count = DistinctValuesOptions {
            order: Some(SortOrder::Desc),
            ..Default::default()
        };
        let values = storage
            .distinct_values(&queue, region.column(), 10, &by_count)
            .await
            .unwrap();
        let summary: Vec<(Option<MetaValue>, i64)> =
            values.into_iter().map(|v| (v.value, v.count)).collect();
        assert_eq!(
            summary,
            vec![
                (Some(MetaValue::Text("eu".into())), 3),
                (None, 2),
                (Some(MetaValue::Text("us".into())), 1),
            ]
        );

        let top = storage
            .distinct_values(&queue, region.column(), 1, &by_count)
            .await
            .unwrap();
        assert_eq!(top.len(), 1);

        let urgent_only = DistinctValuesOptions {
            filter: Some(urgent.eq(true)),
            order: Some(SortOrder::Asc),
            ..Default::default()
        };
        let values = storage
            .distinct_values(&queue, region.column(), 10, &urgent_only)
            .await
            .unwrap();
        assert_eq!(values.iter().map(|v| v.count).collect::<Vec<_>>(), vec![1, 2]);

        assert!(storage
            .distinct_values(&queue, "meta_missing", 10, &by_count)
            .await
            .is_err());
        assert!(storage
            .distinct_values(&queue, region.column(), 0, &by_count)
            .await
            .is_err());
    }
}
