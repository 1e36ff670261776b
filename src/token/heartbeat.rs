//! Per-session authentication state and background keep-alives.
//!
//! Hard-won credentials (cookies, tokens) are stored per session in a
//! concurrent map so thousands of workers can read them without lock
//! contention. Entries are immutable snapshots replaced atomically; a
//! worker that wants exclusive use of a session claims it through a
//! compare-and-swap on the snapshot's availability flag. A background loop
//! keeps the upstream session alive and feeds any cookies it receives back
//! into the tracked states.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cluster::proto::Cookie;
use crate::session::Session;

/// Authentication credentials for one session. Retrieved snapshots are
/// never mutated in place; only the availability flag is written through.
#[derive(Debug)]
pub struct SessionAuthState {
    pub session_id: u32,
    /// Most recently obtained JWT; empty until acquired.
    pub token: String,
    /// Complete cookie set for the session, newest write wins per name.
    pub cookies: Vec<Cookie>,
    pub last_refreshed: DateTime<Utc>,
    available: AtomicBool,
}

impl SessionAuthState {
    pub fn new(session_id: u32) -> Self {
        Self {
            session_id,
            token: String::new(),
            cookies: Vec::new(),
            last_refreshed: Utc::now(),
            available: AtomicBool::new(false),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn with_availability(mut self, available: bool) -> Self {
        self.available = AtomicBool::new(available);
        self
    }
}

/// Background keep-alive driver plus the session auth-state store.
pub struct HeartbeatManager {
    sessions: DashMap<u32, Arc<SessionAuthState>>,
    keep_alive_url: String,
    client: reqwest::Client,
    interval: Duration,
    cancel: CancellationToken,
    stopped: AtomicBool,
    heartbeat_count: AtomicU64,
}

impl HeartbeatManager {
    /// `keep_alive_url` may be empty to disable network keep-alives and use
    /// the manager purely as a state store.
    pub fn new(keep_alive_url: impl Into<String>, interval: Duration, client: reqwest::Client) -> Self {
        Self {
            sessions: DashMap::new(),
            keep_alive_url: keep_alive_url.into(),
            client,
            interval: if interval.is_zero() { Duration::from_secs(30) } else { interval },
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            heartbeat_count: AtomicU64::new(0),
        }
    }

    /// Stores or replaces the state for a session.
    pub fn set_state(&self, state: SessionAuthState) {
        self.sessions.insert(state.session_id, Arc::new(state));
    }

    /// Stable snapshot of a session's state, readable without locking.
    pub fn get_state(&self, session_id: u32) -> Option<Arc<SessionAuthState>> {
        self.sessions.get(&session_id).map(|entry| entry.value().clone())
    }

    /// First session currently marked available, if any. Racing callers
    /// settle the contest through [`HeartbeatManager::claim_session`].
    pub fn find_available(&self) -> Option<Arc<SessionAuthState>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().is_available())
            .map(|entry| entry.value().clone())
    }

    /// Atomically flips the session from available to claimed. Exactly one
    /// of any number of concurrent claimers sees `true`.
    pub fn claim_session(&self, session_id: u32) -> bool {
        let Some(state) = self.get_state(session_id) else {
            return false;
        };
        state
            .available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Merges the response's `Set-Cookie` headers into the session's state:
    /// replace by name, append otherwise. A cookie whose name contains
    /// `jwt` or `token` (case-insensitive) updates the stored JWT, as does
    /// an `Authorization: Bearer …` response header. The session is marked
    /// available whenever at least one cookie was extracted. Responses
    /// without cookies are a no-op.
    pub fn extract_from_response(&self, session_id: u32, response: &reqwest::Response) {
        let new_cookies: Vec<Cookie> = response
            .headers()
            .get_all(http::header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        if new_cookies.is_empty() {
            return;
        }

        let mut base = match self.get_state(session_id) {
            Some(existing) => SessionAuthState {
                session_id,
                token: existing.token.clone(),
                cookies: existing.cookies.clone(),
                last_refreshed: existing.last_refreshed,
                available: AtomicBool::new(existing.is_available()),
            },
            None => SessionAuthState::new(session_id),
        };

        for cookie in &new_cookies {
            let lname = cookie.name.to_ascii_lowercase();
            if lname.contains("jwt") || lname.contains("token") {
                base.token = cookie.value.clone();
                break;
            }
        }
        if let Some(auth) = response
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
        {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                base.token = token.to_string();
            }
        }

        base.cookies = merge_cookies(base.cookies, new_cookies);
        base.last_refreshed = Utc::now();
        self.set_state(base.with_availability(true));
    }

    /// Applies the session state's cookies to a live session's jar for
    /// `url`. No state or no cookies is a no-op.
    pub fn apply_cookies(&self, session_id: u32, session: &Session, url: &Url) {
        let Some(state) = self.get_state(session_id) else {
            return;
        };
        for cookie in &state.cookies {
            session.add_cookie(&cookie.to_set_cookie_string(), url);
        }
    }

    /// Snapshot of every tracked session state.
    pub fn all_states(&self) -> Vec<Arc<SessionAuthState>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Successful keep-alive round-trips since start.
    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeat_count.load(Ordering::Relaxed)
    }

    /// Launches the keep-alive loop, attaching the token of the first
    /// listed session that has one and re-extracting cookies from each
    /// reply into every listed session. Errors from single iterations are
    /// dropped. No-op after `stop`, even a `stop` that preceded any start.
    pub fn start(self: &Arc<Self>, session_ids: Vec<u32>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = ticker.tick() => manager.send_keep_alive(&session_ids).await,
                }
            }
        });
    }

    /// Stops the background loop. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    async fn send_keep_alive(&self, session_ids: &[u32]) {
        if self.keep_alive_url.is_empty() {
            return;
        }

        let mut request = self.client.get(&self.keep_alive_url);
        if let Some(token) = session_ids.iter().find_map(|id| {
            self.get_state(*id)
                .filter(|state| !state.token.is_empty())
                .map(|state| state.token.clone())
        }) {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                log::debug!("keep-alive request failed: {err}");
                return;
            }
        };
        if !response.status().is_success() {
            return;
        }

        self.heartbeat_count.fetch_add(1, Ordering::Relaxed);
        for id in session_ids {
            self.extract_from_response(*id, &response);
        }
    }
}

/// Minimal `Set-Cookie` parser covering the attributes the engine uses.
fn parse_set_cookie(raw: &str) -> Option<Cookie> {
    let mut parts = raw.split(';');
    let pair = parts.next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        ..Default::default()
    };

    for attr in parts {
        let attr = attr.trim();
        let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
        match key.to_ascii_lowercase().as_str() {
            "domain" => cookie.domain = val.trim().to_string(),
            "path" => cookie.path = val.trim().to_string(),
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            "max-age" => {
                if let Ok(secs) = val.trim().parse::<i64>() {
                    cookie.expires_unix = Utc::now().timestamp() + secs;
                }
            }
            "expires" => {
                if let Ok(when) = DateTime::parse_from_rfc2822(val.trim()) {
                    cookie.expires_unix = when.timestamp();
                }
            }
            _ => {}
        }
    }
    Some(cookie)
}

/// All of `existing`, with same-named entries replaced by `updates` and new
/// names appended.
fn merge_cookies(existing: Vec<Cookie>, updates: Vec<Cookie>) -> Vec<Cookie> {
    let mut out = existing;
    for update in updates {
        match out.iter_mut().find(|c| c.name == update.name) {
            Some(slot) => *slot = update,
            None => out.push(update),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<HeartbeatManager> {
        Arc::new(HeartbeatManager::new(
            "",
            Duration::from_secs(30),
            reqwest::Client::new(),
        ))
    }

    fn state_with_cookies(id: u32, names: &[&str], available: bool) -> SessionAuthState {
        SessionAuthState {
            session_id: id,
            token: String::new(),
            cookies: names
                .iter()
                .map(|name| Cookie {
                    name: name.to_string(),
                    value: "v".into(),
                    ..Default::default()
                })
                .collect(),
            last_refreshed: Utc::now(),
            available: AtomicBool::new(available),
        }
    }

    #[test]
    fn stores_and_reads_state() {
        let m = manager();
        m.set_state(state_with_cookies(1, &["sid"], false));
        let state = m.get_state(1).unwrap();
        assert_eq!(state.cookies.len(), 1);
        assert!(m.get_state(2).is_none());
    }

    #[test]
    fn find_available_skips_claimed() {
        let m = manager();
        m.set_state(state_with_cookies(1, &[], false));
        m.set_state(state_with_cookies(2, &[], true));
        assert_eq!(m.find_available().unwrap().session_id, 2);
    }

    #[test]
    fn claim_contest_has_exactly_one_winner() {
        let m = manager();
        m.set_state(state_with_cookies(5, &[], true));

        let counter = Arc::new(std::sync::Mutex::new(0u32));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let m = m.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    *counter.lock().unwrap() += 1;
                    m.claim_session(5)
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(*counter.lock().unwrap(), 20);
        assert!(!m.claim_session(5), "already claimed");
        assert!(!m.claim_session(99), "unknown sessions cannot be claimed");
    }

    #[test]
    fn merges_by_name() {
        let existing = vec![
            Cookie { name: "a".into(), value: "1".into(), ..Default::default() },
            Cookie { name: "b".into(), value: "2".into(), ..Default::default() },
        ];
        let updates = vec![
            Cookie { name: "b".into(), value: "9".into(), ..Default::default() },
            Cookie { name: "c".into(), value: "3".into(), ..Default::default() },
        ];
        let merged = merge_cookies(existing, updates);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].value, "9");
        assert_eq!(merged[2].name, "c");
    }

    #[test]
    fn parses_set_cookie_attributes() {
        let cookie = parse_set_cookie("auth_token=xyz; Domain=.example.com; Path=/; Secure; HttpOnly").unwrap();
        assert_eq!(cookie.name, "auth_token");
        assert_eq!(cookie.value, "xyz");
        assert_eq!(cookie.domain, ".example.com");
        assert!(cookie.secure);
        assert!(cookie.http_only);
        assert_eq!(cookie.expires_unix, 0);

        assert!(parse_set_cookie("no-equals-sign").is_none());
    }

    #[test]
    fn extracts_cookies_and_token_from_response() {
        let m = manager();
        let http_response = http::Response::builder()
            .header("set-cookie", "sid=abc; Path=/")
            .header("set-cookie", "auth_jwt=eyJ0; HttpOnly")
            .body("")
            .unwrap();
        let response = reqwest::Response::from(http_response);

        m.extract_from_response(9, &response);

        let state = m.get_state(9).unwrap();
        assert_eq!(state.cookies.len(), 2);
        assert_eq!(state.token, "eyJ0", "jwt-named cookie becomes the token");
        assert!(state.is_available(), "fresh cookies mark the session claimable");
    }

    #[test]
    fn response_without_cookies_is_a_no_op() {
        let m = manager();
        let response = reqwest::Response::from(http::Response::builder().body("").unwrap());
        m.extract_from_response(3, &response);
        assert!(m.get_state(3).is_none());
    }

    #[test]
    fn max_age_sets_absolute_expiry() {
        let cookie = parse_set_cookie("sid=1; Max-Age=60").unwrap();
        let now = Utc::now().timestamp();
        assert!((cookie.expires_unix - now - 60).abs() <= 2);
    }
}
