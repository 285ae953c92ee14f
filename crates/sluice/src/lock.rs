//! Non-blocking, cluster-wide exclusive execution.
//!
//! [`LockManager::try_run_exclusive`] runs a body only if it can take two
//! locks without waiting:
//!
//! 1. a process-local mutex keyed by the lock id, which turns contention
//!    between tasks of the same process into an immediate miss without a
//!    database round trip;
//! 2. a database advisory lock with the same id, held by the caller's
//!    session, which is what actually excludes other processes.
//!
//! Whoever misses either lock gets `Ok(None)` right away. The advisory lock
//! is released before the call returns, whether the body succeeded or not.
//! If the call is dropped before that, the session is told to abandon the
//! lock synchronously (see [`AdvisoryLockSession::abandon_advisory_lock`]).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::error::QueueError;

tokio::task_local! {
    /// `(manager, lock id)` pairs whose local tier the current task holds.
    static HELD_LOCAL: HashSet<(usize, i64)>;
}

/// A database session able to take session-scoped advisory locks.
#[async_trait]
pub trait AdvisoryLockSession: Send {
    /// Try to take the lock without waiting. `Ok(false)` when another session
    /// holds it.
    async fn try_advisory_lock(&mut self, lock_id: i64) -> Result<bool, QueueError>;

    /// Release a lock taken by this session. `Ok(false)` when this session
    /// did not hold it.
    async fn advisory_unlock(&mut self, lock_id: i64) -> Result<bool, QueueError>;

    /// Called without awaiting when an exclusive run is dropped while this
    /// session may hold `lock_id`, or when the release failed. The lock must
    /// end up free once the session itself is dropped; a pooled connection
    /// is closed instead of being returned to the pool.
    fn abandon_advisory_lock(&mut self, lock_id: i64);
}

#[cfg(feature = "sql")]
#[async_trait]
impl AdvisoryLockSession for sqlx::pool::PoolConnection<sqlx::Postgres> {
    async fn try_advisory_lock(&mut self, lock_id: i64) -> Result<bool, QueueError> {
        sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut **self)
            .await
            .map_err(|e| QueueError::persistence("try advisory lock failed", e))
    }

    async fn advisory_unlock(&mut self, lock_id: i64) -> Result<bool, QueueError> {
        sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .fetch_one(&mut **self)
            .await
            .map_err(|e| QueueError::persistence("advisory unlock failed", e))
    }

    fn abandon_advisory_lock(&mut self, lock_id: i64) {
        // Session locks die with the backend.
        tracing::warn!(lock_id, "closing connection that may still hold an advisory lock");
        self.close_on_drop();
    }
}

/// Disarmed once the advisory lock is known to be released.
struct HeldAdvisory<'s, S: AdvisoryLockSession + ?Sized> {
    session: &'s mut S,
    lock_id: i64,
    armed: bool,
}

impl<S: AdvisoryLockSession + ?Sized> Drop for HeldAdvisory<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.session.abandon_advisory_lock(self.lock_id);
        }
    }
}

/// Registry of process-local locks plus the two-tier run primitive.
///
/// Entries are created on first use of a lock id and never removed; the set
/// of ids used for maintenance is small and fixed. Share one manager (behind
/// an `Arc`) between every component of the process that coordinates on the
/// same ids.
///
/// The local tier is reentrant per task: a body that calls back into
/// `try_run_exclusive` with its own lock id skips the local tier and only
/// takes the advisory lock again, which succeeds on the same session.
/// Spawned tasks do not inherit the holds of their parent.
#[derive(Default)]
pub struct LockManager {
    local: DashMap<i64, Arc<Mutex<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn local_lock(&self, lock_id: i64) -> Arc<Mutex<()>> {
        self.local
            .entry(lock_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn local_key(&self, lock_id: i64) -> (usize, i64) {
        (self as *const Self as usize, lock_id)
    }

    /// Number of distinct lock ids seen so far.
    pub fn registered(&self) -> usize {
        self.local.len()
    }

    /// Run `body` if both lock tiers can be taken immediately.
    ///
    /// Returns `Ok(None)` when either lock is held elsewhere. Errors from the
    /// body are returned after the advisory lock has been released.
    pub async fn try_run_exclusive<S, R, F>(
        &self,
        session: &mut S,
        lock_id: i64,
        body: F,
    ) -> Result<Option<R>, QueueError>
    where
        S: AdvisoryLockSession + ?Sized,
        R: Send,
        F: for<'c> FnOnce(&'c mut S) -> BoxFuture<'c, Result<R, QueueError>> + Send,
    {
        let key = self.local_key(lock_id);
        let mut held_local = HELD_LOCAL
            .try_with(|held| held.clone())
            .unwrap_or_default();
        let _local_guard = if held_local.contains(&key) {
            None
        } else {
            let Ok(guard) = self.local_lock(lock_id).try_lock_owned() else {
                tracing::debug!(lock_id, "lock held by another task of this process");
                return Ok(None);
            };
            held_local.insert(key);
            Some(guard)
        };

        let mut held = HeldAdvisory {
            session,
            lock_id,
            armed: true,
        };
        if !held.session.try_advisory_lock(lock_id).await? {
            held.armed = false;
            tracing::debug!(lock_id, "advisory lock held by another session");
            return Ok(None);
        }

        let result = HELD_LOCAL
            .scope(held_local, body(&mut *held.session))
            .await;

        match held.session.advisory_unlock(lock_id).await {
            Ok(true) => held.armed = false,
            Ok(false) => {
                held.armed = false;
                tracing::warn!(lock_id, "advisory lock was not held at release");
            }
            Err(unlock_err) => {
                // Still armed: the guard abandons the lock on the way out.
                // Keep the body's error if there is one; it is the root cause.
                tracing::warn!(lock_id, error = %unlock_err, "failed to release advisory lock");
                if result.is_ok() {
                    return Err(unlock_err);
                }
            }
        }

        result.map(Some)
    }
}
