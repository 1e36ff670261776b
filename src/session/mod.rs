//! The Session type, the engine's fundamental unit of work.
//!
//! Each session owns its own HTTP client, cookie jar, and ordered header
//! set so it can operate fully independently of every other session, even
//! with 2 000 of them live at once. Mutable fields sit behind the session's
//! own locks; concurrent `execute` calls are safe.

pub mod manager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Method;
use thiserror::Error;
use url::Url;

use crate::client::headers::OrderedHeaderMap;
use crate::client::{build_client, ClientError, TransportConfig};
use crate::fingerprint::Profile;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {id}: create HTTP client: {source}")]
    Create {
        id: u32,
        #[source]
        source: ClientError,
    },
    #[error("session {id}: execute {method} {url}: {source}")]
    Execute {
        id: u32,
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Lifecycle states. Transitions are monotonic except `Active ↔ Challenge`;
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Challenge,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Active => "active",
            SessionState::Challenge => "challenge",
            SessionState::Closed => "closed",
        }
    }

    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Active) | (Active, Challenge) | (Challenge, Active) | (Idle, Closed) | (Active, Closed) | (Challenge, Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One independent automation session.
pub struct Session {
    id: u32,
    client: reqwest::Client,
    cookies: Arc<Jar>,
    proxy: Option<String>,
    headers: RwLock<OrderedHeaderMap>,
    state: RwLock<SessionState>,
    token: RwLock<String>,
    available: AtomicBool,
    created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
}

impl Session {
    /// Constructs a session with a dedicated transport pinned to `profile`
    /// and `proxy`. The profile's header set becomes the session's base
    /// layer; callers override entries afterwards with [`Session::set_header`].
    pub fn new(
        id: u32,
        proxy: Option<String>,
        profile: &Profile,
        request_timeout: Duration,
        transport: &TransportConfig,
    ) -> Result<Self, SessionError> {
        let (client, cookies) = build_client(profile, proxy.as_deref(), request_timeout, transport)
            .map_err(|source| SessionError::Create { id, source })?;

        let now = Utc::now();
        Ok(Self {
            id,
            client,
            cookies,
            proxy,
            headers: RwLock::new(profile.base_headers()),
            state: RwLock::new(SessionState::Idle),
            token: RwLock::new(String::new()),
            available: AtomicBool::new(false),
            created_at: now,
            last_activity: RwLock::new(now),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Proxy endpoint this session dials through, if any. Immutable after
    /// construction; the actual proxy is baked into the transport.
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().expect("session lock poisoned")
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().expect("session lock poisoned")
    }

    /// Attempts a lifecycle transition, returning whether it was legal.
    /// Illegal transitions leave the state untouched.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut guard = self.state.write().expect("session lock poisoned");
        if guard.can_transition_to(next) {
            *guard = next;
            true
        } else {
            false
        }
    }

    /// Current bearer token; empty until one is acquired.
    pub fn token(&self) -> String {
        self.token.read().expect("session lock poisoned").clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().expect("session lock poisoned") = token.into();
    }

    /// Marks the session claimable by a worker.
    pub fn release(&self) {
        self.available.store(true, Ordering::Release);
    }

    /// Atomically claims the session. Exactly one of any number of
    /// concurrent claimers wins.
    pub fn claim(&self) -> bool {
        self.available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Replaces or appends a header. Visible to the next `execute` call.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.write().expect("session lock poisoned").set(name, value);
    }

    pub fn remove_header(&self, name: &str) {
        self.headers.write().expect("session lock poisoned").del(name);
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .read()
            .expect("session lock poisoned")
            .get(name)
            .map(str::to_string)
    }

    /// Adds a `Set-Cookie`-style string to the session's jar for `url`.
    pub fn add_cookie(&self, cookie: &str, url: &Url) {
        self.cookies.add_cookie_str(cookie, url);
    }

    /// `Cookie` header value the jar would send to `url`, if any.
    pub fn cookies_for(&self, url: &Url) -> Option<String> {
        self.cookies
            .cookies(url)
            .and_then(|v| v.to_str().map(str::to_string).ok())
    }

    /// Sends an HTTP request through the session's pinned transport.
    ///
    /// The ordered header set is snapshotted under a read-lock and applied
    /// in insertion order. Any response, success or error status alike,
    /// refreshes `last_activity`; the caller owns the response body.
    /// Transport errors carry the session id, method, and URL, and never
    /// close or demote the session.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, SessionError> {
        let header_map = {
            let guard = self.headers.read().expect("session lock poisoned");
            guard.to_header_map()
        };

        let mut builder = self.client.request(method.clone(), url).headers(header_map);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|source| SessionError::Execute {
            id: self.id,
            method,
            url: url.to_string(),
            source,
        })?;

        self.touch();
        Ok(response)
    }

    /// Records the current time as the session's last activity. Called
    /// automatically by `execute`; call manually after out-of-band work on
    /// the session.
    pub fn touch(&self) {
        *self.last_activity.write().expect("session lock poisoned") = Utc::now();
    }

    /// Transitions to `Closed`. The transport's idle pool drains once the
    /// last reference to the session drops. After `close` the session must
    /// not be used.
    pub fn close(&self) {
        let mut guard = self.state.write().expect("session lock poisoned");
        *guard = SessionState::Closed;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("proxy", &self.proxy)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: u32) -> Session {
        Session::new(
            id,
            None,
            &Profile::chrome_120(),
            Duration::from_secs(5),
            &TransportConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn starts_idle_with_base_headers() {
        let s = session(0);
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.header("User-Agent").unwrap().contains("Chrome/120"));
        assert!(s.token().is_empty());
    }

    #[test]
    fn lifecycle_transitions_are_enforced() {
        let s = session(1);
        assert!(s.transition(SessionState::Active));
        assert!(s.transition(SessionState::Challenge));
        assert!(s.transition(SessionState::Active));
        assert!(!s.transition(SessionState::Idle), "active cannot go back to idle");
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(!s.transition(SessionState::Active), "closed is terminal");
    }

    #[test]
    fn header_overrides_win_over_base_layer() {
        let s = session(2);
        s.set_header("user-agent", "custom/1.0");
        assert_eq!(s.header("User-Agent").as_deref(), Some("custom/1.0"));
        s.remove_header("User-Agent");
        assert!(s.header("User-Agent").is_none());
    }

    #[test]
    fn claim_race_has_single_winner() {
        let s = Arc::new(session(3));
        s.release();
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.claim())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(!s.is_available());
    }
}
