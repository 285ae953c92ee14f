use std::sync::Arc;

use async_trait::async_trait;

use crate::condition::Condition;
use crate::config::{ClusterConfig, SendOptions};
use crate::error::QueueError;
use crate::inspect::{DistinctValue, DistinctValuesOptions, MessageAge};
use crate::lifecycle::MessageCounts;
use crate::queue::{
    Message, MutateResult, Mutation, Queue, ReceiveOptions, SendMessage, SendResult,
};
use crate::shard::ShardStrategy;
use crate::sweep::SweepOutcome;
use crate::types::{MessageId, ShardNumber};

/// Storage backend for queue tables.
///
/// Every call is one unit of work: it either applies completely or fails
/// without side effects. Races against other consumers are not errors; they
/// show up as shorter results and smaller counts.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Insert `messages` into `shard`, all or nothing. Returns their ids in
    /// input order.
    async fn send(
        &self,
        queue: &Queue,
        shard: ShardNumber,
        messages: &[SendMessage],
    ) -> Result<Vec<MessageId>, QueueError> {
        self.send_batched(queue, shard, messages, &SendOptions::default())
            .await?
            .into_result()
    }

    /// Insert `messages` into `shard` chunk by chunk.
    ///
    /// A failing chunk is reported in the result and handled according to
    /// `options.partial_insert`; `Err` is left for failures of the call as
    /// a whole, such as a lost connection at commit.
    async fn send_batched(
        &self,
        queue: &Queue,
        shard: ShardNumber,
        messages: &[SendMessage],
        options: &SendOptions,
    ) -> Result<SendResult, QueueError>;

    /// Lease up to `options.limit` ready or retry messages.
    ///
    /// May sweep dead messages of the queue first; a failed sweep is logged
    /// and does not fail the receive.
    async fn receive(
        &self,
        queue: &Queue,
        options: &ReceiveOptions,
    ) -> Result<Vec<Message>, QueueError>;

    /// Delete messages by id. Returns how many rows were actually removed.
    async fn delete(&self, queue: &Queue, ids: &[MessageId]) -> Result<u64, QueueError>;

    /// Apply `mutations` to every message in `ids`.
    async fn mutate(
        &self,
        queue: &Queue,
        mutations: &[Mutation],
        ids: &[MessageId],
    ) -> Result<MutateResult, QueueError>;

    /// Count messages per lifecycle state, optionally restricted by `filter`.
    async fn count(
        &self,
        queue: &Queue,
        filter: Option<&Condition>,
    ) -> Result<MessageCounts, QueueError>;

    /// Whether the queue holds no messages at all.
    async fn is_empty(&self, queue: &Queue) -> Result<bool, QueueError>;

    /// Whether every message left in the queue is dead.
    async fn is_dead_or_empty(&self, queue: &Queue) -> Result<bool, QueueError>;

    /// Age of the oldest, newest and longest-waiting receivable message.
    async fn message_age(&self, queue: &Queue) -> Result<MessageAge, QueueError>;

    /// Up to `limit` distinct values of the meta column `column`, with the
    /// number of messages carrying each.
    async fn distinct_values(
        &self,
        queue: &Queue,
        column: &str,
        limit: u32,
        options: &DistinctValuesOptions,
    ) -> Result<Vec<DistinctValue>, QueueError>;

    /// Sweep the queue now, regardless of the sweep probability.
    async fn sweep(&self, queue: &Queue, limit_hint: u32) -> Result<SweepOutcome, QueueError>;
}

/// Sends messages of one queue, choosing a shard per batch.
pub struct Producer<S: ?Sized> {
    storage: Arc<S>,
    queue: Queue,
    strategy: ShardStrategy,
    shard_count: i32,
    options: SendOptions,
}

impl<S: QueueStorage + ?Sized> Producer<S> {
    pub fn new(storage: Arc<S>, queue: Queue, cluster: &ClusterConfig) -> Self {
        Self {
            storage,
            queue,
            strategy: ShardStrategy::default(),
            shard_count: cluster.shard_count,
            options: SendOptions::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: ShardStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Chunking and partial-insert behaviour of [`send_batched`](Self::send_batched).
    pub fn with_send_options(mut self, options: SendOptions) -> Result<Self, QueueError> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Send a batch into one shard picked by the strategy, all or nothing.
    pub async fn send(&self, messages: &[SendMessage]) -> Result<Vec<MessageId>, QueueError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let shard = self.strategy.pick(self.shard_count, &mut rand::thread_rng());
        self.storage.send(&self.queue, shard, messages).await
    }

    /// Send a batch into one shard, chunked per the producer's send options.
    pub async fn send_batched(&self, messages: &[SendMessage]) -> Result<SendResult, QueueError> {
        if messages.is_empty() {
            return Ok(SendResult::default());
        }
        let shard = self.strategy.pick(self.shard_count, &mut rand::thread_rng());
        self.storage
            .send_batched(&self.queue, shard, messages, &self.options)
            .await
    }
}

/// Receives and acknowledges messages of one queue.
pub struct Consumer<S: ?Sized> {
    storage: Arc<S>,
    queue: Queue,
    shards: Option<Vec<ShardNumber>>,
}

impl<S: QueueStorage + ?Sized> Consumer<S> {
    pub fn new(storage: Arc<S>, queue: Queue) -> Self {
        Self {
            storage,
            queue,
            shards: None,
        }
    }

    /// Only receive from `shards`, typically the shards this node consumes.
    pub fn with_shards(mut self, shards: Vec<ShardNumber>) -> Self {
        self.shards = Some(shards);
        self
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub async fn receive(&self, mut options: ReceiveOptions) -> Result<Vec<Message>, QueueError> {
        if options.shards.is_none() {
            options.shards = self.shards.clone();
        }
        self.storage.receive(&self.queue, &options).await
    }

    /// Acknowledge processed messages.
    pub async fn delete(&self, ids: &[MessageId]) -> Result<u64, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.storage.delete(&self.queue, ids).await
    }

    pub async fn delete_messages(&self, messages: &[Message]) -> Result<u64, QueueError> {
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        self.delete(&ids).await
    }
}
