//! Continuous job assignment.
//!
//! The scheduler bridges the session manager and the worker pool: a single
//! control task sweeps the session ids and submits one job per session to
//! the pool, over and over, until stopped. Submission blocks on pool
//! back-pressure, which is the engine's only rate governor. The scheduler
//! itself is policy-free; retries, metrics, and application logic live in
//! the caller's job closure.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::session::manager::SessionManager;
use crate::session::Session;
use crate::worker::WorkerPool;

/// Fans work out to sessions via the worker pool.
pub struct Scheduler {
    sessions: Arc<SessionManager>,
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(sessions: Arc<SessionManager>, pool: Arc<WorkerPool>) -> Self {
        Self {
            sessions,
            pool,
            cancel: CancellationToken::new(),
        }
    }

    /// Begins continuous assignment: for every registered session the
    /// control task submits `job_fn(session)` to the pool. Non-blocking;
    /// the control task runs until [`Scheduler::stop`].
    ///
    /// `job_fn` is called once per session per sweep and must be safe for
    /// concurrent use; sessions missing from the manager are skipped
    /// silently.
    pub fn start<F, Fut>(&self, job_fn: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let sessions = self.sessions.clone();
        let pool = self.pool.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                let count = sessions.count();
                if count == 0 {
                    // Nothing to dispatch yet; back off briefly rather than
                    // spinning against an empty manager.
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    continue;
                }

                for id in 0..count as u32 {
                    let Some(session) = sessions.get_session(id) else {
                        continue;
                    };
                    if pool.submit(job_fn(session)).await.is_err() {
                        // Pool stopped underneath us; nothing left to drive.
                        return;
                    }
                }

                tokio::task::yield_now().await;
            }
        });
    }

    /// Stops dispatching new jobs after the current sweep. In-flight jobs
    /// keep running until the pool drains. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::proxy::ProxyManager;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    async fn manager_with(count: usize) -> Arc<SessionManager> {
        let cfg = Config {
            number_of_sessions: count,
            request_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        let manager = Arc::new(SessionManager::new(&cfg));
        manager.create_sessions(count, &ProxyManager::new()).await.unwrap();
        manager
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dispatches_every_session_repeatedly() {
        let sessions = manager_with(3).await;
        let pool = Arc::new(WorkerPool::new(4));
        pool.start().await.unwrap();

        let seen: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));
        let dispatched = Arc::new(AtomicUsize::new(0));

        let scheduler = Scheduler::new(sessions, pool.clone());
        let seen_in_job = seen.clone();
        let counter = dispatched.clone();
        scheduler.start(move |session| {
            let seen = seen_in_job.clone();
            let counter = counter.clone();
            async move {
                seen.lock().unwrap().insert(session.id());
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop();
        pool.stop().await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, HashSet::from([0, 1, 2]));
        // More than one sweep completed.
        assert!(dispatched.load(Ordering::Relaxed) > 3);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sessions = manager_with(1).await;
        let pool = Arc::new(WorkerPool::new(1));
        pool.start().await.unwrap();
        let scheduler = Scheduler::new(sessions, pool.clone());
        scheduler.start(|_session| async {});
        scheduler.stop();
        scheduler.stop();
        pool.stop().await;
    }
}
