//! SessionManager owns the full session population.
//!
//! Reads (`get_session`, `count`) take a shared lock so lookups never block
//! each other; batch mutation (`create_sessions`, `stop_all`) takes the
//! exclusive lock. Session ids are dense (`0..count`) and stable for the
//! manager's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::client::TransportConfig;
use crate::config::Config;
use crate::fingerprint::Profile;
use crate::proxy::ProxyManager;
use crate::session::{Session, SessionError, SessionState};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("{failed} session(s) failed to create; first error: {first}")]
    Create {
        failed: usize,
        #[source]
        first: SessionError,
    },
}

/// Manages up to 2 000 concurrent sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
    profile: Profile,
    request_timeout: Duration,
    transport: TransportConfig,
}

impl SessionManager {
    pub fn new(config: &Config) -> Self {
        Self::with_profile(config, Profile::default())
    }

    /// Every session this manager creates is pinned to `profile`; mixing
    /// profiles within one node would itself be a fingerprint signal.
    pub fn with_profile(config: &Config, profile: Profile) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            profile,
            request_timeout: config.request_timeout,
            transport: TransportConfig {
                max_idle_conns_per_host: config.max_idle_conns_per_host,
                ..TransportConfig::default()
            },
        }
    }

    /// Creates `count` sessions concurrently, one task per session, each
    /// pulling the next proxy from `proxies` (round-robin) or connecting
    /// direct when the list is empty.
    ///
    /// All creation tasks report through a channel sized to `count` and are
    /// joined before this returns. On partial failure the successes stay
    /// registered and the error carries the failure count plus the first
    /// error observed.
    pub async fn create_sessions(
        &self,
        count: usize,
        proxies: &ProxyManager,
    ) -> Result<(), ManagerError> {
        let (tx, mut rx) = mpsc::channel::<Result<Session, SessionError>>(count.max(1));

        for id in 0..count {
            let proxy = proxies.next_proxy();
            let profile = self.profile.clone();
            let timeout = self.request_timeout;
            let transport = self.transport.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = Session::new(id as u32, proxy, &profile, timeout, &transport);
                // The channel has room for every result; send only fails if
                // the manager itself went away.
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        // Collect every result before touching the map so the write lock is
        // never held across an await point.
        let mut created = Vec::with_capacity(count);
        let mut failed = 0usize;
        let mut first_error = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(session) => created.push(session),
                Err(err) => {
                    failed += 1;
                    first_error.get_or_insert(err);
                }
            }
        }

        {
            let mut guard = self.sessions.write().expect("session map poisoned");
            for session in created {
                guard.insert(session.id(), Arc::new(session));
            }
        }

        match first_error {
            Some(first) => Err(ManagerError::Create { failed, first }),
            None => Ok(()),
        }
    }

    pub fn get_session(&self, id: u32) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session map poisoned")
            .get(&id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().expect("session map poisoned").len()
    }

    /// Transitions every idle session to active. Uses each session's own
    /// lock so 2 000 transitions do not serialise on the manager lock.
    pub fn start_all(&self) {
        let guard = self.sessions.read().expect("session map poisoned");
        for session in guard.values() {
            session.transition(SessionState::Active);
        }
    }

    /// Closes every session and empties the map. Dropping the last session
    /// reference drains its transport's idle connections.
    pub fn stop_all(&self) {
        let mut guard = self.sessions.write().expect("session map poisoned");
        for session in guard.values() {
            session.close();
        }
        guard.clear();
    }
}
