//! Inline removal of dead messages.
//!
//! Consumers call [`SweepEngine::maybe_sweep`] from inside a receive. A
//! random draw decides whether this call sweeps at all; if it does, the
//! sweep runs bounded `DELETE ... LIMIT` batches under the queue's exclusive
//! lock, so at most one session in the cluster sweeps a queue at a time and
//! everyone else simply skips.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use crate::config::SweepConfig;
use crate::error::QueueError;
use crate::lock::{AdvisoryLockSession, LockManager};
use crate::types::QueueName;

/// A session that can delete dead messages of a queue.
#[async_trait]
pub trait SweepTarget: AdvisoryLockSession {
    /// Delete at most `max_rows` dead messages from `queue` and return how
    /// many were removed.
    ///
    /// A failed delete must leave the session usable, so that the advisory
    /// lock can still be released and the caller's work can continue.
    async fn delete_dead_messages(
        &mut self,
        queue: &QueueName,
        max_rows: u32,
    ) -> Result<u64, QueueError>;
}

/// Result of one sweep attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The sweep ran; `iterations` delete statements removed `removed` rows.
    Completed { removed: u64, iterations: u32 },
    /// Another task or session was sweeping the queue; nothing was done.
    LockNotAcquired,
}

impl SweepOutcome {
    pub fn removed(&self) -> u64 {
        match self {
            SweepOutcome::Completed { removed, .. } => *removed,
            SweepOutcome::LockNotAcquired => 0,
        }
    }
}

/// Decides when to sweep and runs the sweep.
pub struct SweepEngine {
    config: SweepConfig,
    locks: Arc<LockManager>,
}

impl SweepEngine {
    pub fn new(config: SweepConfig, locks: Arc<LockManager>) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self { config, locks })
    }

    /// Default configuration with a private lock manager.
    pub fn with_defaults() -> Self {
        Self {
            config: SweepConfig::default(),
            locks: Arc::new(LockManager::new()),
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Advisory lock id guarding sweeps of `queue`.
    pub fn lock_id(&self, queue: &QueueName) -> i64 {
        (self.config.lock_id_generator)(queue)
    }

    /// Whether this call should sweep.
    ///
    /// Every call draws independently, so the realized rate only
    /// approximates `probability` percent.
    pub fn need_sweep(&self) -> bool {
        self.need_sweep_with(&mut rand::thread_rng())
    }

    pub fn need_sweep_with<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if !self.config.enabled {
            return false;
        }
        rng.gen_range(0.0..100.0) < self.config.probability
    }

    /// Sweep `queue` now, unless another session is already sweeping it.
    ///
    /// Each batch deletes up to `max(limit_hint, max_rows)` rows. Batches
    /// continue until one removes fewer rows than that or `max_iterations`
    /// batches have run.
    pub async fn sweep<S>(
        &self,
        session: &mut S,
        queue: &QueueName,
        limit_hint: u32,
    ) -> Result<SweepOutcome, QueueError>
    where
        S: SweepTarget + ?Sized,
    {
        let lock_id = self.lock_id(queue);
        let rows_per_batch = limit_hint.max(self.config.max_rows);
        let max_iterations = self.config.max_iterations;
        let target = queue.clone();

        let outcome = self
            .locks
            .try_run_exclusive(session, lock_id, move |session| {
                Box::pin(async move {
                    sweep_batches(session, &target, rows_per_batch, max_iterations).await
                })
            })
            .await?;

        match outcome {
            Some((removed, iterations)) => {
                tracing::debug!(queue = %queue, removed, iterations, "sweep completed");
                Ok(SweepOutcome::Completed {
                    removed,
                    iterations,
                })
            }
            None => {
                tracing::debug!(queue = %queue, lock_id, "sweep skipped, queue is being swept elsewhere");
                Ok(SweepOutcome::LockNotAcquired)
            }
        }
    }

    /// Sweep if the random draw says so. Never fails: errors are logged and
    /// reported as `None`, the same as not sweeping.
    pub async fn maybe_sweep<S>(
        &self,
        session: &mut S,
        queue: &QueueName,
        limit_hint: u32,
    ) -> Option<SweepOutcome>
    where
        S: SweepTarget + ?Sized,
    {
        if !self.need_sweep() {
            return None;
        }
        match self.sweep(session, queue, limit_hint).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "inline sweep failed");
                None
            }
        }
    }
}

async fn sweep_batches<S>(
    session: &mut S,
    queue: &QueueName,
    rows_per_batch: u32,
    max_iterations: u32,
) -> Result<(u64, u32), QueueError>
where
    S: SweepTarget + ?Sized,
{
    let mut removed = 0;
    let mut iterations = 0;
    loop {
        let batch = session.delete_dead_messages(queue, rows_per_batch).await?;
        removed += batch;
        iterations += 1;
        if iterations >= max_iterations || batch < u64::from(rows_per_batch) {
            return Ok((removed, iterations));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_lock::{MemoryAdvisoryLocks, MemoryLockSession};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// A session over a bare counter of dead rows.
    struct DeadRows {
        lock: MemoryLockSession,
        dead: u64,
        batches: Vec<u32>,
        fail: bool,
        stall: Option<std::time::Duration>,
    }

    #[async_trait]
    impl AdvisoryLockSession for DeadRows {
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
    impl SweepTarget for DeadRows {
        async fn delete_dead_messages(
            &mut self,
            _queue: &QueueName,
            max_rows: u32,
        ) -> Result<u64, QueueError> {
            if self.fail {
                return Err(QueueError::PersistenceError {
                    reason: "disk on fire".into(),
                    source: None,
                });
            }
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            self.batches.push(max_rows);
            let removed = self.dead.min(u64::from(max_rows));
            self.dead -= removed;
            Ok(removed)
        }
    }

    fn engine(config: SweepConfig) -> SweepEngine {
        SweepEngine::new(config, Arc::new(LockManager::new())).unwrap()
    }

    fn rows(locks: &MemoryAdvisoryLocks, dead: u64) -> DeadRows {
        DeadRows {
            lock: locks.session(),
            dead,
            batches: Vec::new(),
            fail: false,
            stall: None,
        }
    }

    fn queue() -> QueueName {
        QueueName::new("orders").unwrap()
    }

    #[test]
    fn new_validates_config() {
        let config = SweepConfig {
            max_rows: 1,
            ..Default::default()
        };
        assert!(SweepEngine::new(config, Arc::new(LockManager::new())).is_err());
    }

    #[test]
    fn need_sweep_extremes() {
        let mut rng = StdRng::seed_from_u64(0);
        let always = engine(SweepConfig {
            probability: 100.0,
            ..Default::default()
        });
        let never = engine(SweepConfig {
            probability: 0.0,
            ..Default::default()
        });
        let disabled = engine(SweepConfig {
            probability: 100.0,
            ..SweepConfig::disabled()
        });
        for _ in 0..1_000 {
            assert!(always.need_sweep_with(&mut rng));
            assert!(!never.need_sweep_with(&mut rng));
            assert!(!disabled.need_sweep_with(&mut rng));
        }
    }

    #[test]
    fn need_sweep_rate_is_close_to_probability() {
        let mut rng = StdRng::seed_from_u64(99);
        let engine = engine(SweepConfig {
            probability: 20.0,
            ..Default::default()
        });
        let hits = (0..100_000).filter(|_| engine.need_sweep_with(&mut rng)).count();
        assert!((18_000..22_000).contains(&hits), "hits = {hits}");
    }

    #[tokio::test]
    async fn sweep_converges_within_iteration_cap() {
        let locks = MemoryAdvisoryLocks::new();
        let engine = engine(SweepConfig {
            max_rows: 500,
            max_iterations: 3,
            probability: 100.0,
            ..Default::default()
        });
        let mut session = rows(&locks, 1_200);

        let outcome = engine.sweep(&mut session, &queue(), 0).await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::Completed {
                removed: 1_200,
                iterations: 3
            }
        );
        assert_eq!(session.batches, vec![500, 500, 500]);

        let outcome = engine.sweep(&mut session, &queue(), 0).await.unwrap();
        assert_eq!(outcome.removed(), 0);
        assert_eq!(
            outcome,
            SweepOutcome::Completed {
                removed: 0,
                iterations: 1
            }
        );
    }

    #[tokio::test]
    async fn sweep_stops_at_iteration_cap() {
        let locks = MemoryAdvisoryLocks::new();
        let engine = engine(SweepConfig {
            max_rows: 100,
            max_iterations: 2,
            ..Default::default()
        });
        let mut session = rows(&locks, 1_000);
        let outcome = engine.sweep(&mut session, &queue(), 0).await.unwrap();
        assert_eq!(outcome.removed(), 200);
        assert_eq!(session.dead, 800);
    }

    #[tokio::test]
    async fn limit_hint_raises_batch_size() {
        let locks = MemoryAdvisoryLocks::new();
        let engine = engine(SweepConfig {
            max_rows: 100,
            max_iterations: 1,
            ..Default::default()
        });
        let mut session = rows(&locks, 1_000);
        engine.sweep(&mut session, &queue(), 250).await.unwrap();
        assert_eq!(session.batches, vec![250]);

        engine.sweep(&mut session, &queue(), 10).await.unwrap();
        assert_eq!(session.batches, vec![250, 100]);
    }

    #[tokio::test]
    async fn sweep_skips_when_queue_is_locked_elsewhere() {
        let locks = MemoryAdvisoryLocks::new();
        let engine = engine(SweepConfig::default());
        let mut holder = locks.session();
        assert!(holder
            .try_advisory_lock(engine.lock_id(&queue()))
            .await
            .unwrap());

        let mut session = rows(&locks, 10);
        let outcome = engine.sweep(&mut session, &queue(), 0).await.unwrap();
        assert_eq!(outcome, SweepOutcome::LockNotAcquired);
        assert_eq!(session.dead, 10);

        // A different queue has a different lock.
        let other = QueueName::new("mail").unwrap();
        let outcome = engine.sweep(&mut session, &other, 0).await.unwrap();
        assert_eq!(outcome.removed(), 10);
    }

    #[tokio::test]
    async fn failed_sweep_is_swallowed_by_maybe_sweep() {
        let locks = MemoryAdvisoryLocks::new();
        let engine = engine(SweepConfig {
            probability: 100.0,
            ..Default::default()
        });
        let mut session = rows(&locks, 10);
        session.fail = true;

        assert!(engine.sweep(&mut session, &queue(), 0).await.is_err());
        assert!(engine.maybe_sweep(&mut session, &queue(), 0).await.is_none());
        // The lock was released despite the failure.
        assert!(!locks.is_held(engine.lock_id(&queue())));

        session.fail = false;
        let outcome = engine.maybe_sweep(&mut session, &queue(), 0).await;
        assert_eq!(outcome.map(|o| o.removed()), Some(10));
    }

    #[tokio::test]
    async fn abandoned_sweep_frees_the_queue_lock() {
        let locks = MemoryAdvisoryLocks::new();
        let engine = engine(SweepConfig::default());
        let mut session = rows(&locks, 10);
        session.stall = Some(std::time::Duration::from_secs(5));

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            engine.sweep(&mut session, &queue(), 0),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(!locks.is_held(engine.lock_id(&queue())));

        let mut next = rows(&locks, 10);
        let outcome = engine.sweep(&mut next, &queue(), 0).await.unwrap();
        assert_eq!(outcome.removed(), 10);
    }

    #[tokio::test]
    async fn lock_id_generator_can_be_overridden() {
        fn fixed(_: &QueueName) -> i64 {
            777
        }
        let engine = engine(SweepConfig {
            lock_id_generator: fixed,
            ..Default::default()
        });
        assert_eq!(engine.lock_id(&queue()), 777);
    }
}
