//! Lock-free engine counters.
//!
//! All counters are plain atomics so the hot request path never touches a
//! mutex, even with 2 000 sessions reporting concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Aggregate request statistics for one worker node.
#[derive(Debug)]
pub struct Metrics {
    total_requests: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn increment_total(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Average request rate since construction. Returns 0.0 within the first
    /// wall-clock instant to avoid division by zero.
    pub fn requests_per_second(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_requests.load(Ordering::Relaxed) as f64 / elapsed
    }

    /// Point-in-time copy of (total, success, failed). The three loads are
    /// not performed under one lock, so the triple may be inconsistent at
    /// nanosecond granularity, which is fine for monitoring.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.success.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_outcomes() {
        let metrics = Metrics::new();
        metrics.increment_total();
        metrics.increment_total();
        metrics.increment_success();
        metrics.increment_failed();
        let (total, success, failed) = metrics.snapshot();
        assert_eq!(total, 2);
        assert_eq!(success, 1);
        assert_eq!(failed, 1);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = std::sync::Arc::new(Metrics::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = metrics.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    m.increment_total();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot().0, 8000);
    }
}
