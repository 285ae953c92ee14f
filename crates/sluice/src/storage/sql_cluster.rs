//! SQL-backed cluster storage using PostgreSQL via sqlx.
//!
//! Tables:
//! - `q__node`: singleton row describing this database node
//! - `q__shard`: one ownership row per shard
//!
//! This module is only available when the `sql` feature is enabled.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::cluster_storage::ClusterStorage;
use crate::config::ClusterConfig;
use crate::error::QueueError;
use crate::node::{generate_server_id, NodeRecord, NODE_STATUS_ACTIVE};
use crate::schema::{CREATE_NODE_TABLE, CREATE_SHARD_TABLE, NODE_TABLE, SHARD_TABLE};
use crate::shard::{initial_assignment, ShardRecord};
use crate::types::{Bucket, ServerId, ShardNumber};

/// PostgreSQL-backed cluster storage.
pub struct SqlClusterStorage {
    pool: PgPool,
    config: ClusterConfig,
}

impl SqlClusterStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            config: ClusterConfig::default(),
        }
    }

    pub fn with_config(pool: PgPool, config: ClusterConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self { pool, config })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn node_from_row(&self, row: &PgRow) -> Result<NodeRecord, QueueError> {
        let server_id: String = try_get_column(row, "server_id")?;
        let created_at: DateTime<Utc> = try_get_column(row, "created_at")?;
        let bucket: Option<i32> = try_get_column(row, "identifiers_bucket")?;
        let identifiers_bucket = bucket
            .map(|b| Bucket::validated(b, self.config.max_bucket))
            .transpose()?;
        Ok(NodeRecord {
            server_id: ServerId(server_id),
            identifiers_bucket,
            created_at,
        })
    }

    fn shard_from_row(&self, row: &PgRow) -> Result<ShardRecord, QueueError> {
        let shard: i32 = try_get_column(row, "shard")?;
        let producer: String = try_get_column(row, "producer_node")?;
        let consumer: Option<String> = try_get_column(row, "consumer_node")?;
        let next_consumer: Option<String> = try_get_column(row, "next_consumer_node")?;
        ShardRecord::new(
            ShardNumber::validated(shard, self.config.shard_count)?,
            ServerId(producer),
            consumer.map(ServerId),
            next_consumer.map(ServerId),
        )
    }
}

#[async_trait]
impl ClusterStorage for SqlClusterStorage {
    async fn ensure_cluster_tables(&self) -> Result<(), QueueError> {
        for ddl in [CREATE_NODE_TABLE, CREATE_SHARD_TABLE] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| QueueError::persistence("create cluster tables failed", e))?;
        }
        Ok(())
    }

    async fn bootstrap_node(&self) -> Result<NodeRecord, QueueError> {
        let candidate = generate_server_id(&mut rand::thread_rng(), self.config.server_id_length);

        // Whoever loses the race inserts nothing and reads the winner's row.
        let sql = format!(
            r#"
            INSERT INTO {NODE_TABLE} (status, server_id)
            VALUES ($1, $2)
            ON CONFLICT (status) DO NOTHING
            "#
        );
        let inserted = sqlx::query(&sql)
            .bind(NODE_STATUS_ACTIVE)
            .bind(&candidate.0)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::persistence("insert node failed", e))?
            .rows_affected();

        let node = self.read_node().await?.ok_or(QueueError::NodeNotBootstrapped)?;
        tracing::info!(
            server_id = %node.server_id,
            inserted = inserted == 1,
            "node bootstrapped"
        );
        Ok(node)
    }

    async fn read_node(&self) -> Result<Option<NodeRecord>, QueueError> {
        let sql = format!(
            r#"
            SELECT server_id, created_at, identifiers_bucket
            FROM {NODE_TABLE}
            WHERE status = $1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(NODE_STATUS_ACTIVE)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::persistence("read node failed", e))?;
        row.map(|row| self.node_from_row(&row)).transpose()
    }

    async fn set_identifiers_bucket(&self, bucket: Option<Bucket>) -> Result<(), QueueError> {
        let bucket = bucket
            .map(|b| Bucket::validated(b.value(), self.config.max_bucket))
            .transpose()?;
        let sql = format!("UPDATE {NODE_TABLE} SET identifiers_bucket = $1 WHERE status = $2");
        let updated = sqlx::query(&sql)
            .bind(bucket.map(|b| b.value()))
            .bind(NODE_STATUS_ACTIVE)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::persistence("update identifiers bucket failed", e))?
            .rows_affected();
        if updated == 0 {
            return Err(QueueError::NodeNotBootstrapped);
        }
        Ok(())
    }

    async fn bootstrap_shards(&self, nodes: &[ServerId]) -> Result<u64, QueueError> {
        let records = initial_assignment(self.config.shard_count, nodes, &mut rand::thread_rng())?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::persistence("begin shard bootstrap failed", e))?;
        let sql = format!(
            r#"
            INSERT INTO {SHARD_TABLE} (shard, producer_node, consumer_node)
            SELECT shard, owner, owner FROM UNNEST($1::int[], $2::varchar[]) AS t(shard, owner)
            ON CONFLICT (shard) DO NOTHING
            "#
        );
        let mut written = 0;
        for chunk in records.chunks(self.config.shard_insert_batch) {
            let shards: Vec<i32> = chunk.iter().map(|r| r.shard().value()).collect();
            let owners: Vec<String> = chunk.iter().map(|r| r.producer().0.clone()).collect();
            written += sqlx::query(&sql)
                .bind(&shards)
                .bind(&owners)
                .execute(&mut *tx)
                .await
                .map_err(|e| QueueError::persistence("insert shards failed", e))?
                .rows_affected();
        }
        tx.commit()
            .await
            .map_err(|e| QueueError::persistence("commit shard bootstrap failed", e))?;

        tracing::info!(written, nodes = nodes.len(), "shards bootstrapped");
        Ok(written)
    }

    async fn read_shards(&self) -> Result<BTreeMap<ShardNumber, ShardRecord>, QueueError> {
        let sql = format!(
            r#"
            SELECT shard, producer_node, consumer_node, next_consumer_node
            FROM {SHARD_TABLE}
            ORDER BY shard
            "#
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::persistence("read shards failed", e))?;

        let mut shards = BTreeMap::new();
        for row in rows {
            let record = self.shard_from_row(&row).inspect_err(|e| {
                tracing::warn!(error = %e, "invalid shard row");
            })?;
            shards.insert(record.shard(), record);
        }
        Ok(shards)
    }
}

pub(crate) fn try_get_column<'r, T>(row: &'r PgRow, column: &str) -> Result<T, QueueError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| QueueError::PersistenceError {
            reason: format!("failed to read '{column}' column: {e}"),
            source: Some(Box::new(e)),
        })
}
