//! Sharded message queues stored in PostgreSQL tables.
//!
//! Each queue is one table. Producers insert rows, consumers lease rows with
//! a visibility timeout and delete them once processed, all inside ordinary
//! transactions. Messages that run out of attempts are swept away inline by
//! consumers, under a cluster-wide advisory lock so only one session sweeps
//! a queue at a time.
//!
//! ```text
//! use sluice::prelude::*;
//!
//! let priority = Field::<i32>::new("priority")?;
//! let queue = Queue::new("orders")?.with_field(&priority);
//!
//! let storage = Arc::new(SqlQueueStorage::new(pool));
//! let producer = Producer::new(storage.clone(), queue.clone(), &ClusterConfig::default());
//! producer
//!     .send(&[SendMessage::new(payload).with_meta(&priority, 5)])
//!     .await?;
//!
//! let consumer = Consumer::new(storage, queue);
//! let messages = consumer
//!     .receive(ReceiveOptions {
//!         limit: 10,
//!         filter: Some(priority.greater(3)),
//!         ..Default::default()
//!     })
//!     .await?;
//! consumer.delete_messages(&messages).await?;
//! ```

pub mod cluster_storage;
pub mod condition;
pub mod config;
pub mod error;
pub mod hash;
pub mod identifier;
pub mod inspect;
pub mod lifecycle;
pub mod lock;
pub mod node;
pub mod queue;
pub mod queue_storage;
pub mod schema;
pub mod shard;
pub mod storage;
pub mod sweep;
pub mod types;

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::cluster_storage::ClusterStorage;
    pub use crate::condition::{Condition, Field, Order, SortOrder};
    pub use crate::config::{ClusterConfig, PartialInsert, QueueOptions, SendOptions, SweepConfig};
    pub use crate::error::QueueError;
    pub use crate::inspect::{DistinctValuesOptions, Inspector, MessageAge, Sample};
    pub use crate::lifecycle::{MessageCounts, MessageState};
    pub use crate::lock::LockManager;
    pub use crate::queue::{
        Message, MessageResult, MutateResult, Mutation, Queue, ReceiveOptions, SendMessage,
        SendResult,
    };
    pub use crate::queue_storage::{Consumer, Producer, QueueStorage};
    pub use crate::shard::ShardStrategy;
    pub use crate::sweep::{SweepEngine, SweepOutcome};
    pub use crate::types::{MessageId, QueueName, ShardNumber};

    #[cfg(feature = "sql")]
    pub use crate::storage::sql_cluster::SqlClusterStorage;
    #[cfg(feature = "sql")]
    pub use crate::storage::sql_queue::SqlQueueStorage;
}
