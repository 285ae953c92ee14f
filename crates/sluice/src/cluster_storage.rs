use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::node::NodeRecord;
use crate::shard::ShardRecord;
use crate::types::{Bucket, ServerId, ShardNumber};

/// Storage backend for the node singleton and the shard ownership table.
#[async_trait]
pub trait ClusterStorage: Send + Sync {
    /// Create the internal tables if they do not exist yet.
    async fn ensure_cluster_tables(&self) -> Result<(), QueueError>;

    /// Make sure the node row exists and return it.
    ///
    /// Safe to race: the first caller inserts a fresh random server id, every
    /// caller (the first included) returns whatever row won.
    async fn bootstrap_node(&self) -> Result<NodeRecord, QueueError>;

    /// Read the node row, if bootstrapped.
    async fn read_node(&self) -> Result<Option<NodeRecord>, QueueError>;

    /// Assign (or clear) the identifier bucket of this node.
    async fn set_identifiers_bucket(&self, bucket: Option<Bucket>) -> Result<(), QueueError>;

    /// Give every shard that has no row yet a random owner from `nodes`.
    /// Returns how many shard rows were written by this call.
    async fn bootstrap_shards(&self, nodes: &[ServerId]) -> Result<u64, QueueError>;

    /// All shard rows keyed by shard number.
    async fn read_shards(&self) -> Result<BTreeMap<ShardNumber, ShardRecord>, QueueError>;
}
