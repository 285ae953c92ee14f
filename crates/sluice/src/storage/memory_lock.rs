use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::QueueError;
use crate::lock::AdvisoryLockSession;

/// In-memory stand-in for database advisory locks, for testing.
///
/// Behaves like PostgreSQL session-level advisory locks: a session may take
/// the same lock several times and must release it as often, and dropping a
/// session releases everything it still holds.
#[derive(Clone, Default)]
pub struct MemoryAdvisoryLocks {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    /// lock id -> (holding session, hold count)
    held: Mutex<HashMap<i64, (u64, u32)>>,
    next_session: AtomicU64,
}

impl MemoryAdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session, the equivalent of a database connection.
    pub fn session(&self) -> MemoryLockSession {
        MemoryLockSession {
            locks: self.clone(),
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Whether any session holds `lock_id`.
    pub fn is_held(&self, lock_id: i64) -> bool {
        self.inner.held.lock().contains_key(&lock_id)
    }

    fn try_lock(&self, session: u64, lock_id: i64) -> bool {
        let mut held = self.inner.held.lock();
        match held.get_mut(&lock_id) {
            Some((owner, count)) if *owner == session => {
                *count += 1;
                true
            }
            Some(_) => false,
            None => {
                held.insert(lock_id, (session, 1));
                true
            }
        }
    }

    fn unlock(&self, session: u64, lock_id: i64) -> bool {
        let mut held = self.inner.held.lock();
        match held.get_mut(&lock_id) {
            Some((owner, count)) if *owner == session => {
                *count -= 1;
                if *count == 0 {
                    held.remove(&lock_id);
                }
                true
            }
            _ => false,
        }
    }

    fn release_session(&self, session: u64) {
        self.inner
            .held
            .lock()
            .retain(|_, (owner, _)| *owner != session);
    }
}

/// One session against [`MemoryAdvisoryLocks`].
pub struct MemoryLockSession {
    locks: MemoryAdvisoryLocks,
    id: u64,
}

impl Drop for MemoryLockSession {
    fn drop(&mut self) {
        self.locks.release_session(self.id);
    }
}

#[async_trait]
impl AdvisoryLockSession for MemoryLockSession {
    async fn try_advisory_lock(&mut self, lock_id: i64) -> Result<bool, QueueError> {
        Ok(self.locks.try_lock(self.id, lock_id))
    }

    async fn advisory_unlock(&mut self, lock_id: i64) -> Result<bool, QueueError> {
        Ok(self.locks.unlock(self.id, lock_id))
    }

    fn abandon_advisory_lock(&mut self, lock_id: i64) {
        self.locks.unlock(self.id, lock_id);
    }
}
