use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::cluster_storage::ClusterStorage;
use crate::config::ClusterConfig;
use crate::error::QueueError;
use crate::node::{generate_server_id, NodeRecord};
use crate::shard::{initial_assignment, ShardRecord};
use crate::types::{Bucket, ServerId, ShardNumber};

/// In-memory cluster storage for testing.
pub struct MemoryClusterStorage {
    config: ClusterConfig,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    node: Option<NodeRecord>,
    shards: BTreeMap<ShardNumber, ShardRecord>,
}

impl MemoryClusterStorage {
    pub fn new() -> Self {
        Self {
            config: ClusterConfig::default(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_config(config: ClusterConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Overwrite one shard row, as an external handoff would.
    pub fn put_shard(&self, record: ShardRecord) {
        self.inner.lock().shards.insert(record.shard(), record);
    }
}

impl Default for MemoryClusterStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterStorage for MemoryClusterStorage {
    async fn ensure_cluster_tables(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn bootstrap_node(&self) -> Result<NodeRecord, QueueError> {
        let candidate = generate_server_id(&mut rand::thread_rng(), self.config.server_id_length);
        let mut inner = self.inner.lock();
        let node = inner.node.get_or_insert_with(|| {
            tracing::info!(server_id = %candidate, "node bootstrapped");
            NodeRecord {
                server_id: candidate,
                identifiers_bucket: None,
                created_at: Utc::now(),
            }
        });
        Ok(node.clone())
    }

    async fn read_node(&self) -> Result<Option<NodeRecord>, QueueError> {
        Ok(self.inner.lock().node.clone())
    }

    async fn set_identifiers_bucket(&self, bucket: Option<Bucket>) -> Result<(), QueueError> {
        let bucket = bucket
            .map(|b| Bucket::validated(b.value(), self.config.max_bucket))
            .transpose()?;
        let mut inner = self.inner.lock();
        let node = inner.node.as_mut().ok_or(QueueError::NodeNotBootstrapped)?;
        node.identifiers_bucket = bucket;
        Ok(())
    }

    async fn bootstrap_shards(&self, nodes: &[ServerId]) -> Result<u64, QueueError> {
        let records = initial_assignment(self.config.shard_count, nodes, &mut rand::thread_rng())?;
        let mut inner = self.inner.lock();
        let mut written = 0;
        for record in records {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                inner.shards.entry(record.shard())
            {
                slot.insert(record);
                written += 1;
            }
        }
        tracing::info!(written, nodes = nodes.len(), "shards bootstrapped");
        Ok(written)
    }

    async fn read_shards(&self) -> Result<BTreeMap<ShardNumber, ShardRecord>, QueueError> {
        Ok(self.inner.lock().shards.clone())
    }
}
