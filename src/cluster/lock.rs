//! Per-key distributed locking.
//!
//! Multiple nodes can race for a shared resource (a login page, a session
//! slot); without coordination that means duplicate submissions and
//! corrupted state. [`DistributedLock`] is the capability contract; the
//! in-memory implementation serves single-node deployments and tests, and
//! its interface shape is what a coordination-store-backed implementation
//! would plug into.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {key:?}: cancelled while waiting")]
    Cancelled { key: String },
    #[error("lock {key:?}: timed out while waiting")]
    Timeout { key: String },
}

/// Per-key mutual exclusion. Keys are arbitrary strings; use descriptive
/// names such as "applicant-page" or "session-slot-42".
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquires the lock for `key`, suspending until it is available or
    /// `cancel` fires. A token that is already cancelled fails immediately.
    async fn lock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError>;

    /// Non-blocking acquisition attempt.
    fn try_lock(&self, key: &str) -> bool;

    /// Releases the lock. A no-op for keys that are not currently locked.
    fn unlock(&self, key: &str);

    /// Advisory: whether `key` is currently held. The answer can be stale
    /// by the time the caller acts on it.
    fn is_locked(&self, key: &str) -> bool;
}

struct KeyLock {
    sem: Arc<Semaphore>,
    /// Tasks holding or waiting on this key. The map entry is pruned when
    /// this reaches zero so transient keys do not accumulate.
    waiters: usize,
}

/// Process-local [`DistributedLock`] backed by per-key semaphores.
/// Contention on one key never blocks tasks contending on another.
#[derive(Default)]
pub struct InMemoryLock {
    locks: Mutex<HashMap<String, KeyLock>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `key`, creating its lock on first use.
    fn checkout(&self, key: &str) -> Arc<Semaphore> {
        let mut guard = self.locks.lock().expect("lock table poisoned");
        let entry = guard.entry(key.to_string()).or_insert_with(|| KeyLock {
            sem: Arc::new(Semaphore::new(1)),
            waiters: 0,
        });
        entry.waiters += 1;
        entry.sem.clone()
    }

    /// Drops one registration for `key`, pruning the entry at zero.
    fn checkin(&self, key: &str) {
        let mut guard = self.locks.lock().expect("lock table poisoned");
        if let Some(entry) = guard.get_mut(key) {
            entry.waiters = entry.waiters.saturating_sub(1);
            if entry.waiters == 0 {
                guard.remove(key);
            }
        }
    }
}

/// Undoes a `checkout` on drop unless disarmed. Keeps the waiter count
/// accurate even when an acquire future is dropped mid-wait (cancellation,
/// a caller-imposed timeout wrapping `lock`), so abandoned waits never pin
/// a map entry.
struct Registration<'a> {
    table: &'a InMemoryLock,
    key: &'a str,
    armed: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.checkin(self.key);
        }
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn lock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled { key: key.to_string() });
        }

        let sem = self.checkout(key);
        // The registration checks back in if this future is abandoned in
        // any way: the cancel arm below, or being dropped from outside
        // while parked on the semaphore.
        let mut registration = Registration {
            table: self,
            key,
            armed: true,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(LockError::Cancelled { key: key.to_string() })
            }
            permit = sem.acquire_owned() => {
                permit.expect("lock semaphore closed").forget();
                // The holder stays registered until unlock checks it in.
                registration.armed = false;
                Ok(())
            }
        }
    }

    fn try_lock(&self, key: &str) -> bool {
        let sem = self.checkout(key);
        match sem.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => {
                self.checkin(key);
                false
            }
        }
    }

    fn unlock(&self, key: &str) {
        let mut guard = self.locks.lock().expect("lock table poisoned");
        let Some(entry) = guard.get_mut(key) else {
            return; // unknown key: no-op
        };
        if entry.sem.available_permits() > 0 {
            return; // not currently held
        }
        entry.sem.add_permits(1);
        entry.waiters = entry.waiters.saturating_sub(1);
        if entry.waiters == 0 {
            guard.remove(key);
        }
    }

    fn is_locked(&self, key: &str) -> bool {
        let guard = self.locks.lock().expect("lock table poisoned");
        guard
            .get(key)
            .map(|entry| entry.sem.available_permits() == 0)
            .unwrap_or(false)
    }
}

/// Acquires `key`, runs `f`, and releases, with an optional wait bound.
pub async fn with_lock<L, F, T>(
    lock: &L,
    cancel: &CancellationToken,
    key: &str,
    wait_timeout: Option<Duration>,
    f: F,
) -> Result<T, LockError>
where
    L: DistributedLock + ?Sized,
    F: FnOnce() -> T,
{
    match wait_timeout {
        Some(bound) => {
            tokio::time::timeout(bound, lock.lock(cancel, key))
                .await
                .map_err(|_| LockError::Timeout { key: key.to_string() })??;
        }
        None => lock.lock(cancel, key).await?,
    }
    let result = f();
    lock.unlock(key);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn lock_and_unlock_round_trip() {
        let lock = InMemoryLock::new();
        let cancel = CancellationToken::new();
        lock.lock(&cancel, "page").await.unwrap();
        assert!(lock.is_locked("page"));
        lock.unlock("page");
        assert!(!lock.is_locked("page"));
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let lock = InMemoryLock::new();
        assert!(lock.try_lock("slot"));
        assert!(!lock.try_lock("slot"));
        lock.unlock("slot");
        assert!(lock.try_lock("slot"));
        lock.unlock("slot");
    }

    #[tokio::test]
    async fn independent_keys_do_not_contend() {
        let lock = InMemoryLock::new();
        assert!(lock.try_lock("a"));
        assert!(lock.try_lock("b"));
        lock.unlock("a");
        lock.unlock("b");
    }

    #[tokio::test]
    async fn cancelled_context_fails_immediately() {
        let lock = InMemoryLock::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = lock.lock(&cancel, "page").await.unwrap_err();
        assert!(matches!(err, LockError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn cancellation_while_waiting_does_not_leak_keys() {
        let lock = Arc::new(InMemoryLock::new());
        assert!(lock.try_lock("busy"));

        let cancel = CancellationToken::new();
        let waiter = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.lock(&cancel, "busy").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(LockError::Cancelled { .. })));

        // The holder can still release, and the key is pruned afterwards.
        lock.unlock("busy");
        assert!(!lock.is_locked("busy"));
        assert!(lock.locks.lock().unwrap().is_empty(), "lock table must be pruned");
    }

    #[tokio::test]
    async fn unlock_unknown_key_is_a_no_op() {
        let lock = InMemoryLock::new();
        lock.unlock("never-seen");
        assert!(!lock.is_locked("never-seen"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn with_lock_serialises_critical_sections() {
        let lock = Arc::new(InMemoryLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let lock = lock.clone();
            let counter = counter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                with_lock(&*lock, &cancel, "counter", None, || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert!(!lock.is_locked("counter"));
    }

    #[tokio::test]
    async fn with_lock_times_out_when_held() {
        let lock = InMemoryLock::new();
        let cancel = CancellationToken::new();
        assert!(lock.try_lock("held"));
        let err = with_lock(&lock, &cancel, "held", Some(Duration::from_millis(20)), || ())
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        // The timed-out wait checked itself back in; only the holder's
        // registration remains, and releasing it prunes the key.
        assert!(lock.is_locked("held"));
        lock.unlock("held");
        assert!(!lock.is_locked("held"));
        assert!(lock.locks.lock().unwrap().is_empty(), "lock table must be pruned");
    }
}
