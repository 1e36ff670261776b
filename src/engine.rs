//! High-level engine orchestration.
//!
//! Wires the subsystems together in the order a worker node boots: proxy
//! list, session population, worker pool, scheduler, metrics monitor. Also
//! owns the graceful shutdown sequence: stop the scheduler, drain the pool,
//! close the sessions, stop the monitor.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Method;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError};
use crate::events::{
    EngineEvent, ErrorEvent, EventDispatcher, LoggingHandler, MetricsHandler, PostResponseEvent,
    PreRequestEvent,
};
use crate::metrics::Metrics;
use crate::proxy::{ProxyError, ProxyManager};
use crate::scheduler::Scheduler;
use crate::session::manager::{ManagerError, SessionManager};
use crate::session::Session;
use crate::worker::{PoolError, WorkerPool};

/// How often the monitor task prints a metrics summary.
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("proxy list: {0}")]
    Proxy(#[from] ProxyError),
    #[error("session creation: {0}")]
    Sessions(#[from] ManagerError),
    #[error("worker pool: {0}")]
    Pool(#[from] PoolError),
}

/// One worker node's session engine.
pub struct Engine {
    config: Config,
    proxies: Arc<ProxyManager>,
    sessions: Arc<SessionManager>,
    pool: Arc<WorkerPool>,
    scheduler: Scheduler,
    metrics: Arc<Metrics>,
    events: Arc<EventDispatcher>,
    cancel: CancellationToken,
}

impl Engine {
    /// Builds an engine from `config`, loading the proxy list when one is
    /// configured. No sessions exist and no tasks run until
    /// [`Engine::start`].
    pub fn new(config: Config) -> Result<Self, EngineError> {
        let proxies = Arc::new(ProxyManager::new());
        if !config.proxy_file.is_empty() {
            proxies.load_file(&config.proxy_file)?;
            log::info!("loaded {} proxies from {}", proxies.count(), config.proxy_file);
        } else {
            log::info!("no proxy file configured; sessions will connect directly");
        }

        let metrics = Arc::new(Metrics::new());
        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        events.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));

        let sessions = Arc::new(SessionManager::new(&config));
        let pool = Arc::new(WorkerPool::new(config.number_of_sessions));
        let scheduler = Scheduler::new(sessions.clone(), pool.clone());

        Ok(Self {
            config,
            proxies,
            sessions,
            pool,
            scheduler,
            metrics,
            events: Arc::new(events),
            cancel: CancellationToken::new(),
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    pub fn events(&self) -> Arc<EventDispatcher> {
        self.events.clone()
    }

    /// Creates the session population and starts driving the default job
    /// (a GET against the configured target URL) through every session.
    pub async fn start(&self) -> Result<(), EngineError> {
        let target = self.config.target_url.clone();
        let metrics = self.metrics.clone();
        let events = self.events.clone();
        self.start_with_job(move |session| {
            let target = target.clone();
            let metrics = metrics.clone();
            let events = events.clone();
            async move {
                drive_session(session, &target, &metrics, &events).await;
            }
        })
        .await
    }

    /// Like [`Engine::start`] but with a caller-supplied job closure; the
    /// closure is the contract surface for retries and application logic.
    pub async fn start_with_job<F, Fut>(&self, job_fn: F) -> Result<(), EngineError>
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        log::info!("creating {} sessions", self.config.number_of_sessions);
        self.sessions
            .create_sessions(self.config.number_of_sessions, &self.proxies)
            .await?;
        log::info!("{} sessions created", self.sessions.count());

        self.pool.start().await?;
        log::info!("worker pool started with {} workers", self.pool.worker_count());

        self.sessions.start_all();
        self.scheduler.start(job_fn);
        log::info!("scheduler started; sessions are now active");

        self.spawn_monitor();
        Ok(())
    }

    fn spawn_monitor(&self) {
        let metrics = self.metrics.clone();
        let sessions = self.sessions.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let (total, success, failed) = metrics.snapshot();
                        log::info!(
                            "metrics - total: {total} | success: {success} | failed: {failed} | rps: {:.1} | sessions: {}",
                            metrics.requests_per_second(),
                            sessions.count()
                        );
                    }
                }
            }
        });
    }

    /// Graceful shutdown: stop dispatching, drain in-flight jobs, close
    /// every session, stop the monitor. Idempotent.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.pool.stop().await;
        self.sessions.stop_all();
        self.cancel.cancel();

        let (total, success, failed) = self.metrics.snapshot();
        log::info!(
            "final metrics - total: {total} | success: {success} | failed: {failed} | rps: {:.1}",
            self.metrics.requests_per_second()
        );
    }
}

/// The default per-session job: one GET against the target, classified into
/// the metrics counters through the event handlers. Transport errors are
/// reported and counted, never fatal.
async fn drive_session(
    session: Arc<Session>,
    target: &str,
    metrics: &Metrics,
    events: &EventDispatcher,
) {
    if target.is_empty() {
        // Nothing to drive; don't spin the scheduler loop hot.
        tokio::time::sleep(Duration::from_millis(100)).await;
        return;
    }

    metrics.increment_total();
    events.dispatch(EngineEvent::PreRequest(PreRequestEvent {
        session_id: session.id(),
        method: Method::GET,
        url: target.to_string(),
        timestamp: Utc::now(),
    }));

    let started = Instant::now();
    match session.execute(Method::GET, target, None).await {
        Ok(response) => {
            let status = response.status().as_u16();
            events.dispatch(EngineEvent::PostResponse(PostResponseEvent {
                session_id: session.id(),
                method: Method::GET,
                url: target.to_string(),
                status,
                latency: started.elapsed(),
                timestamp: Utc::now(),
            }));
        }
        Err(err) => {
            events.dispatch(EngineEvent::Error(ErrorEvent {
                session_id: session.id(),
                error: err.to_string(),
                timestamp: Utc::now(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(sessions: usize) -> Config {
        Config {
            number_of_sessions: sessions,
            request_timeout: Duration::from_secs(5),
            ..Config::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn full_lifecycle_with_custom_job() {
        let engine = Engine::new(config(4)).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();
        engine
            .start_with_job(move |_session| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.shutdown().await;

        assert!(executed.load(Ordering::Relaxed) >= 4, "each session ran at least once");
        assert_eq!(engine.sessions().count(), 0, "shutdown closes all sessions");
    }

    #[tokio::test]
    async fn missing_proxy_file_is_fatal() {
        let cfg = Config {
            proxy_file: "/nonexistent/proxies.txt".into(),
            ..config(1)
        };
        assert!(matches!(Engine::new(cfg), Err(EngineError::Proxy(_))));
    }
}
