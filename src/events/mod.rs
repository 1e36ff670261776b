//! Engine event hooks.
//!
//! Subsystems emit structured events around request activity and cluster
//! synchronisation; handlers react to them for logging and metrics without
//! the hot path knowing who is listening.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::Method;

use crate::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub session_id: u32,
    pub method: Method,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PostResponseEvent {
    pub session_id: u32,
    pub method: Method,
    pub url: String,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub session_id: u32,
    pub kind: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CookieSyncEvent {
    pub cookie_count: usize,
    pub jar_version: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub session_id: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    PreRequest(PreRequestEvent),
    PostResponse(PostResponseEvent),
    Challenge(ChallengeEvent),
    CookieSync(CookieSyncEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events through the `log` facade.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::PreRequest(pre) => {
                log::debug!("session {} -> {} {}", pre.session_id, pre.method, pre.url);
            }
            EngineEvent::PostResponse(post) => {
                log::debug!(
                    "session {} <- {} {} -> {} ({:.2}s)",
                    post.session_id,
                    post.method,
                    post.url,
                    post.status,
                    post.latency.as_secs_f64()
                );
            }
            EngineEvent::Challenge(challenge) => {
                log::info!(
                    "session {} challenge {} success={}",
                    challenge.session_id,
                    challenge.kind,
                    challenge.success
                );
            }
            EngineEvent::CookieSync(sync) => {
                log::info!(
                    "cookie sync: {} cookie(s) at jar v{}",
                    sync.cookie_count,
                    sync.jar_version
                );
            }
            EngineEvent::Error(error) => {
                log::warn!("session {} error: {}", error.session_id, error.error);
            }
        }
    }
}

/// Feeds the engine counters.
pub struct MetricsHandler {
    metrics: Arc<Metrics>,
}

impl MetricsHandler {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::PostResponse(post) => {
                if post.status < 400 {
                    self.metrics.increment_success();
                } else {
                    self.metrics.increment_failed();
                }
            }
            EngineEvent::Error(_) => self.metrics.increment_failed(),
            _ => {}
        }
    }
}
