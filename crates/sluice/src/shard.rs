//! Shard ownership records.
//!
//! Every shard is owned by one producer node and is, at any time, in one of
//! two forms:
//!
//! - **stable**: `producer == consumer`, `next_consumer` is null
//! - **migrating**: `producer == next_consumer`, `consumer` is null
//!
//! The database enforces the same rule with a check constraint. Moving a
//! shard between the two forms is the job of a rebalancing protocol that
//! lives outside this crate.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::types::{ServerId, ShardNumber};

/// One row of the shard table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    shard: ShardNumber,
    producer: ServerId,
    consumer: Option<ServerId>,
    next_consumer: Option<ServerId>,
}

/// Decoded ownership form of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardOwnership<'a> {
    /// One node produces into and consumes from the shard.
    Stable { owner: &'a ServerId },
    /// Producers already write to `next_consumer`, nobody consumes until the
    /// handoff completes.
    Migrating {
        producer: &'a ServerId,
        next_consumer: &'a ServerId,
    },
}

impl ShardRecord {
    /// Build a record, rejecting owner combinations that are neither stable
    /// nor migrating.
    pub fn new(
        shard: ShardNumber,
        producer: ServerId,
        consumer: Option<ServerId>,
        next_consumer: Option<ServerId>,
    ) -> Result<Self, QueueError> {
        let stable = consumer.as_ref() == Some(&producer) && next_consumer.is_none();
        let migrating = next_consumer.as_ref() == Some(&producer) && consumer.is_none();
        if stable == migrating {
            return Err(QueueError::InvalidShardState {
                shard,
                producer: producer.0,
                consumer: consumer.map(|c| c.0),
                next_consumer: next_consumer.map(|c| c.0),
            });
        }
        Ok(Self {
            shard,
            producer,
            consumer,
            next_consumer,
        })
    }

    /// A stably owned shard, as written by bootstrap.
    pub fn stable(shard: ShardNumber, owner: ServerId) -> Self {
        Self {
            shard,
            consumer: Some(owner.clone()),
            producer: owner,
            next_consumer: None,
        }
    }

    pub fn shard(&self) -> ShardNumber {
        self.shard
    }

    pub fn producer(&self) -> &ServerId {
        &self.producer
    }

    pub fn consumer(&self) -> Option<&ServerId> {
        self.consumer.as_ref()
    }

    pub fn next_consumer(&self) -> Option<&ServerId> {
        self.next_consumer.as_ref()
    }

    pub fn ownership(&self) -> ShardOwnership<'_> {
        match &self.next_consumer {
            Some(next_consumer) => ShardOwnership::Migrating {
                producer: &self.producer,
                next_consumer,
            },
            None => ShardOwnership::Stable {
                owner: &self.producer,
            },
        }
    }
}

/// Pick a uniformly random owner for every shard in `1..=shard_count`.
///
/// Each shard starts stable, with the chosen node as both producer and
/// consumer.
pub fn initial_assignment<R: Rng + ?Sized>(
    shard_count: i32,
    nodes: &[ServerId],
    rng: &mut R,
) -> Result<Vec<ShardRecord>, QueueError> {
    if nodes.is_empty() {
        return Err(QueueError::invalid_config(
            "cannot assign shards to an empty node list",
        ));
    }
    let mut records = Vec::with_capacity(shard_count.max(0) as usize);
    for shard in ShardNumber::all(shard_count) {
        let owner = nodes
            .choose(rng)
            .ok_or_else(|| QueueError::invalid_config("empty node list"))?;
        records.push(ShardRecord::stable(shard, owner.clone()));
    }
    Ok(records)
}

/// Shards a node should currently consume from.
///
/// Migrating shards have no consumer and are skipped.
pub fn consumed_by(shards: &BTreeMap<ShardNumber, ShardRecord>, node: &ServerId) -> Vec<ShardNumber> {
    shards
        .values()
        .filter(|record| record.consumer() == Some(node))
        .map(ShardRecord::shard)
        .collect()
}

/// Shards a node should currently produce into.
pub fn produced_by(shards: &BTreeMap<ShardNumber, ShardRecord>, node: &ServerId) -> Vec<ShardNumber> {
    shards
        .values()
        .filter(|record| record.producer() == node)
        .map(ShardRecord::shard)
        .collect()
}

/// How a producer chooses the shard for a batch of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardStrategy {
    /// A uniformly random shard per batch.
    #[default]
    Random,
    /// Always the same shard.
    Fixed(ShardNumber),
}

impl ShardStrategy {
    pub fn pick<R: Rng + ?Sized>(&self, shard_count: i32, rng: &mut R) -> ShardNumber {
        match self {
            ShardStrategy::Random => ShardNumber::new_unchecked(rng.gen_range(1..=shard_count.max(1))),
            ShardStrategy::Fixed(shard) => *shard,
        }
    }
}
