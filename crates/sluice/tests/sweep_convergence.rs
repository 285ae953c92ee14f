//! Dead-message sweeps over the in-memory backend, including two "processes"
//! sharing one database.

use std::sync::Arc;

use sluice::lock::AdvisoryLockSession;
use sluice::prelude::*;
use sluice::storage::memory_queue::MemoryQueueStorage;

fn engine(config: SweepConfig) -> SweepEngine {
    SweepEngine::new(config, Arc::new(LockManager::new())).unwrap()
}

fn eager(max_rows: u32, max_iterations: u32) -> SweepConfig {
    SweepConfig {
        probability: 100.0,
        max_rows,
        max_iterations,
        ..Default::default()
    }
}

fn shard() -> ShardNumber {
    ShardNumber::validated(1, ClusterConfig::default().shard_count).unwrap()
}

/// Send `count` messages and mark them all dead.
async fn fill_dead(storage: &MemoryQueueStorage, queue: &Queue, count: usize) {
    let batch: Vec<SendMessage> = (0..100).map(|_| SendMessage::new(Vec::new())).collect();
    for chunk in 0..count.div_ceil(100) {
        let take = (count - chunk * 100).min(100);
        let ids = storage.send(queue, shard(), &batch[..take]).await.unwrap();
        storage
            .mutate(queue, &[Mutation::SetRemainingAttempts(0)], &ids)
            .await
            .unwrap();
    }
    assert_eq!(storage.count(queue, None).await.unwrap().dead, count as i64);
}

#[tokio::test]
async fn sweep_stops_after_a_short_batch() {
    let db = MemoryQueueStorage::new().with_sweep(engine(SweepConfig::disabled()));
    let queue = Queue::new("dead_letters").unwrap();
    fill_dead(&db, &queue, 1200).await;

    let sweeper = db.attach(engine(eager(500, 3)));
    let outcome = sweeper.sweep(&queue, 0).await.unwrap();
    // 500 + 500 + 200: the short third batch ends the sweep.
    assert_eq!(
        outcome,
        SweepOutcome::Completed {
            removed: 1200,
            iterations: 3
        }
    );
    assert_eq!(db.row_count(&queue), 0);

    let again = sweeper.sweep(&queue, 0).await.unwrap();
    assert_eq!(
        again,
        SweepOutcome::Completed {
            removed: 0,
            iterations: 1
        }
    );
}

#[tokio::test]
async fn sweep_is_bounded_by_iterations() {
    let db = MemoryQueueStorage::new().with_sweep(engine(SweepConfig::disabled()));
    let queue = Queue::new("backlog").unwrap();
    fill_dead(&db, &queue, 1600).await;

    let sweeper = db.attach(engine(eager(500, 3)));
    assert_eq!(sweeper.sweep(&queue, 0).await.unwrap().removed(), 1500);
    assert_eq!(db.row_count(&queue), 100);
    assert_eq!(sweeper.sweep(&queue, 0).await.unwrap().removed(), 100);
}

#[tokio::test]
async fn large_receive_limit_widens_batches() {
    let db = MemoryQueueStorage::new().with_sweep(engine(SweepConfig::disabled()));
    let queue = Queue::new("wide").unwrap();
    fill_dead(&db, &queue, 700).await;

    let sweeper = db.attach(engine(eager(100, 1)));
    let outcome = sweeper.sweep(&queue, 700).await.unwrap();
    assert_eq!(
        outcome,
        SweepOutcome::Completed {
            removed: 700,
            iterations: 1
        }
    );
}

#[tokio::test]
async fn receive_sweeps_and_still_delivers_live_messages() {
    let db = MemoryQueueStorage::new().with_sweep(engine(SweepConfig::disabled()));
    let queue = Queue::new("mixed").unwrap();
    fill_dead(&db, &queue, 250).await;
    db.send(&queue, shard(), &[SendMessage::new(b"alive".to_vec())])
        .await
        .unwrap();

    let consumer = db.attach(engine(eager(100, 5)));
    let leased = consumer
        .receive(&queue, &ReceiveOptions::with_limit(10))
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].payload, b"alive".to_vec());
    assert_eq!(db.row_count(&queue), 1);
}

#[tokio::test]
async fn sweep_skips_while_another_session_holds_the_lock() {
    let db = MemoryQueueStorage::new().with_sweep(engine(SweepConfig::disabled()));
    let queue = Queue::new("contended").unwrap();
    fill_dead(&db, &queue, 150).await;

    let sweeper = db.attach(engine(eager(100, 5)));
    let lock_id = sweeper.sweep_engine().lock_id(queue.name());

    // Some other process is mid-sweep.
    let mut other = db.advisory_locks().session();
    assert!(other.try_advisory_lock(lock_id).await.unwrap());

    assert_eq!(
        sweeper.sweep(&queue, 0).await.unwrap(),
        SweepOutcome::LockNotAcquired
    );
    // Receive still works; it just does not sweep.
    assert!(sweeper
        .receive(&queue, &ReceiveOptions::default())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(db.row_count(&queue), 150);

    assert!(other.advisory_unlock(lock_id).await.unwrap());
    assert_eq!(sweeper.sweep(&queue, 0).await.unwrap().removed(), 150);
    assert!(!db.advisory_locks().is_held(lock_id));
}

#[tokio::test]
async fn dropped_session_releases_its_locks() {
    let db = MemoryQueueStorage::new().with_sweep(engine(SweepConfig::disabled()));
    let queue = Queue::new("crashed").unwrap();
    fill_dead(&db, &queue, 10).await;
    let sweeper = db.attach(engine(eager(100, 1)));
    let lock_id = sweeper.sweep_engine().lock_id(queue.name());

    {
        let mut crashed = db.advisory_locks().session();
        assert!(crashed.try_advisory_lock(lock_id).await.unwrap());
        assert_eq!(
            sweeper.sweep(&queue, 0).await.unwrap(),
            SweepOutcome::LockNotAcquired
        );
    }

    assert_eq!(sweeper.sweep(&queue, 0).await.unwrap().removed(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sweepers_remove_each_row_once() {
    let db = MemoryQueueStorage::new().with_sweep(engine(SweepConfig::disabled()));
    let queue = Queue::new("racing").unwrap();
    fill_dead(&db, &queue, 2000).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let sweeper = db.attach(engine(eager(100, 2)));
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut removed = 0;
            for _ in 0..20 {
                removed += sweeper.sweep(&queue, 0).await.unwrap().removed();
                tokio::task::yield_now().await;
            }
            removed
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    // 4 sweepers x 20 rounds x 200 rows is more than enough capacity.
    assert_eq!(total, 2000);
    assert_eq!(db.row_count(&queue), 0);
}
