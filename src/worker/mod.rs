//! Bounded worker pool.
//!
//! A fixed population of tasks drains a shared queue whose capacity is four
//! jobs per worker: enough buffer that workers pick up the next job without
//! a context switch, small enough that memory stays constant regardless of
//! offered load. `submit` suspends when the buffer is full, which is the
//! engine's back-pressure path, and `stop` closes the queue then waits for
//! every already-accepted job to return.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Submitting after `stop` is a caller bug, reported rather than
    /// panicking.
    #[error("worker pool is stopped")]
    Stopped,
    #[error("worker pool was already started")]
    AlreadyStarted,
}

/// Fixed-size pool of job-draining tasks.
pub struct WorkerPool {
    worker_count: usize,
    tx: StdMutex<Option<mpsc::Sender<Job>>>,
    rx: StdMutex<Option<mpsc::Receiver<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool with `worker_count` workers (values below 1 are
    /// normalised to 1) and a queue buffering `worker_count * 4` jobs.
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::channel(worker_count * 4);
        Self {
            worker_count,
            tx: StdMutex::new(Some(tx)),
            rx: StdMutex::new(Some(rx)),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Launches the worker tasks. Must be called exactly once before jobs
    /// are submitted.
    pub async fn start(&self) -> Result<(), PoolError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }
        let rx = self
            .rx
            .lock()
            .expect("pool lock poisoned")
            .take()
            .ok_or(PoolError::AlreadyStarted)?;
        let shared = std::sync::Arc::new(Mutex::new(rx));

        let mut handles = self.handles.lock().await;
        for _ in 0..self.worker_count {
            let queue = shared.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    // The queue lock is held only while waiting for the next
                    // job, never while running one, so execution stays
                    // parallel across workers.
                    let job = {
                        let mut rx = queue.lock().await;
                        rx.recv().await
                    };
                    match job {
                        Some(job) => {
                            if let Err(panic) = std::panic::AssertUnwindSafe(job).catch_unwind().await {
                                log::error!("worker job panicked: {}", panic_message(&panic));
                            }
                        }
                        None => break,
                    }
                }
            }));
        }
        Ok(())
    }

    /// Enqueues a job, suspending while the buffer is full. Returns
    /// [`PoolError::Stopped`] once `stop` has been called.
    pub async fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = {
            let guard = self.tx.lock().expect("pool lock poisoned");
            guard.clone().ok_or(PoolError::Stopped)?
        };
        sender.send(Box::pin(job)).await.map_err(|_| PoolError::Stopped)
    }

    /// Closes the queue and waits until every accepted job has returned.
    /// Idempotent; the second call returns once the first has drained.
    pub async fn stop(&self) {
        // Dropping the sender closes the channel; workers drain what is
        // already buffered and then exit.
        drop(self.tx.lock().expect("pool lock poisoned").take());

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn drains_every_job_before_stop_returns() {
        let pool = WorkerPool::new(64);
        pool.start().await.unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5_000 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .await
            .unwrap();
        }
        pool.stop().await;
        assert_eq!(counter.load(Ordering::Relaxed), 5_000);
    }

    #[tokio::test]
    async fn zero_workers_normalised_to_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.worker_count(), 1);
    }

    #[tokio::test]
    async fn submit_after_stop_is_an_error() {
        let pool = WorkerPool::new(2);
        pool.start().await.unwrap();
        pool.stop().await;
        let result = pool.submit(async {}).await;
        assert_eq!(result, Err(PoolError::Stopped));
    }

    #[tokio::test]
    async fn stop_twice_does_not_panic() {
        let pool = WorkerPool::new(2);
        pool.start().await.unwrap();
        pool.stop().await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let pool = WorkerPool::new(2);
        pool.start().await.unwrap();
        assert_eq!(pool.start().await, Err(PoolError::AlreadyStarted));
        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_job_does_not_kill_workers() {
        let pool = WorkerPool::new(1);
        pool.start().await.unwrap();
        pool.submit(async { panic!("boom") }).await.unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        pool.submit(async move {
            flag.fetch_add(1, Ordering::Relaxed);
        })
        .await
        .unwrap();
        pool.stop().await;
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_applies_back_pressure() {
        let pool = Arc::new(WorkerPool::new(1));
        pool.start().await.unwrap();

        let gate = Arc::new(tokio::sync::Notify::new());
        // Occupy the single worker.
        let held = gate.clone();
        pool.submit(async move { held.notified().await }).await.unwrap();
        // Give the worker a moment to dequeue the gate job so the buffer
        // below is truly empty before we fill it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Fill the 4-slot buffer.
        for _ in 0..4 {
            pool.submit(async {}).await.unwrap();
        }
        // The next submit must suspend until the worker frees a slot.
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.submit(async {})).await;
        assert!(blocked.is_err(), "submit should block on a full queue");

        gate.notify_one();
        pool.stop().await;
    }
}
