//! JWT refresh management.
//!
//! Holds the current JWT behind a readers-writer lock so thousands of tasks
//! can read it without contention, decodes claims from the base64url payload
//! segment (signature verification is intentionally omitted; the engine
//! trusts the server-issued token), and renews the token from a configured
//! refresh endpoint before it expires.

pub mod heartbeat;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed JWT: expected 3 segments, got {0}")]
    Segments(usize),
    #[error("decode JWT payload: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("unmarshal JWT claims: {0}")]
    Claims(#[from] serde_json::Error),
    #[error("refresh URL is not configured")]
    NoRefreshUrl,
    #[error("heartbeat URL is not configured")]
    NoHeartbeatUrl,
    #[error("refresh request: {0}")]
    Http(#[from] reqwest::Error),
    #[error("refresh returned HTTP {0}")]
    RefreshStatus(u16),
    #[error("refresh returned an empty token")]
    EmptyToken,
    #[error("heartbeat returned HTTP {0}")]
    HeartbeatStatus(u16),
}

/// Decodes the payload segment of a JWT into a claims map. No signature
/// verification.
pub fn parse_claims(token: &str) -> Result<serde_json::Map<String, Value>, TokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(TokenError::Segments(parts.len()));
    }
    // JWT payloads are base64url without padding.
    let payload = URL_SAFE_NO_PAD.decode(parts[1])?;
    let claims: serde_json::Map<String, Value> = serde_json::from_slice(&payload)?;
    Ok(claims)
}

/// True when the token cannot be parsed or its `exp` claim (seconds since
/// the Unix epoch) is in the past. A missing or non-numeric `exp` means
/// non-expiring.
pub fn is_expired(token: &str) -> bool {
    let claims = match parse_claims(token) {
        Ok(claims) => claims,
        Err(_) => return true,
    };
    match claims.get("exp").and_then(Value::as_f64) {
        Some(exp) => chrono::Utc::now().timestamp() >= exp as i64,
        None => false,
    }
}

/// Seconds-since-epoch expiry from the `exp` claim, if present and numeric.
fn expiry_of(token: &str) -> Option<i64> {
    parse_claims(token)
        .ok()?
        .get("exp")
        .and_then(Value::as_f64)
        .map(|exp| exp as i64)
}

/// Manages a single JWT: storage, expiry checks, refresh, and heartbeats.
pub struct TokenManager {
    token: RwLock<String>,
    refresh_url: String,
    heartbeat_url: String,
    client: reqwest::Client,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl TokenManager {
    /// `client` should carry a request timeout; running the refresh loop
    /// without one is a misconfiguration.
    pub fn new(refresh_url: impl Into<String>, heartbeat_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            token: RwLock::new(String::new()),
            refresh_url: refresh_url.into(),
            heartbeat_url: heartbeat_url.into(),
            client,
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> String {
        self.token.read().expect("token lock poisoned").clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().expect("token lock poisoned") = token.into();
    }

    /// Fetches a new token from the refresh URL: reads up to 8 KiB of body,
    /// trims whitespace, rejects empty results, and stores the rest.
    pub async fn refresh(&self) -> Result<(), TokenError> {
        if self.refresh_url.is_empty() {
            return Err(TokenError::NoRefreshUrl);
        }

        let response = self.client.get(&self.refresh_url).send().await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(TokenError::RefreshStatus(status));
        }

        let body = response.bytes().await?;
        let body = &body[..body.len().min(8192)];
        let token = String::from_utf8_lossy(body).trim().to_string();
        if token.is_empty() {
            return Err(TokenError::EmptyToken);
        }
        self.set_token(token);
        Ok(())
    }

    /// Single keep-alive GET to the heartbeat URL carrying the current
    /// token as a bearer credential.
    pub async fn send_heartbeat(&self) -> Result<(), TokenError> {
        if self.heartbeat_url.is_empty() {
            return Err(TokenError::NoHeartbeatUrl);
        }

        let mut request = self.client.get(&self.heartbeat_url);
        let token = self.token();
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(TokenError::HeartbeatStatus(status));
        }
        Ok(())
    }

    /// Launches the background refresh task. On each tick the token is
    /// renewed when it is missing, unparsable, expired, or within
    /// `refresh_before` of its expiry. Single-iteration failures are
    /// swallowed so one bad refresh never kills the loop.
    ///
    /// No-op after `stop`, including a `stop` that happened before any
    /// start: the shutdown guard is one-shot by design.
    pub fn start_auto_refresh(self: &std::sync::Arc<Self>, check_interval: Duration, refresh_before: Duration) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if manager.needs_refresh(refresh_before) {
                            if let Err(err) = manager.refresh().await {
                                log::debug!("token refresh failed: {err}");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Launches the background heartbeat task. Errors from individual
    /// heartbeats are logged and dropped.
    pub fn start_heartbeat(self: &std::sync::Arc<Self>, interval: Duration) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = manager.send_heartbeat().await {
                            log::debug!("heartbeat failed: {err}");
                        }
                    }
                }
            }
        });
    }

    fn needs_refresh(&self, refresh_before: Duration) -> bool {
        let token = self.token();
        if token.is_empty() || is_expired(&token) {
            return true;
        }
        match expiry_of(&token) {
            Some(exp) => {
                let deadline = exp - refresh_before.as_secs() as i64;
                chrono::Utc::now().timestamp() >= deadline
            }
            None => false,
        }
    }

    /// Terminates all background tasks. Idempotent; calling before any
    /// start consumes the guard so later starts never launch.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn make_jwt(payload: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.as_bytes());
        format!("{header}.{body}.sig")
    }

    /// Serves `body` with status 200 to every connection, counting hits.
    async fn serve(body: &'static str) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        (addr, hits)
    }

    #[test]
    fn parses_claims() {
        let token = make_jwt(r#"{"sub":"worker-1","exp":1700000000}"#);
        let claims = parse_claims(&token).unwrap();
        assert_eq!(claims["sub"], "worker-1");
        assert_eq!(claims["exp"], 1700000000i64);
    }

    #[test]
    fn malformed_tokens_fail_to_parse() {
        assert!(matches!(parse_claims("only.two"), Err(TokenError::Segments(2))));
        assert!(parse_claims("a.!!!.c").is_err());
    }

    #[test]
    fn expiry_semantics() {
        assert!(is_expired(&make_jwt(r#"{"exp":1}"#)), "1970 expiry");
        assert!(!is_expired(&make_jwt(r#"{"exp":9999999999}"#)), "far future");
        assert!(is_expired("garbage"), "unparsable counts as expired");
        assert!(!is_expired(&make_jwt(r#"{"sub":"no-exp"}"#)), "missing exp never expires");
        assert!(!is_expired(&make_jwt(r#"{"exp":"soon"}"#)), "non-numeric exp never expires");
    }

    #[tokio::test]
    async fn refresh_stores_trimmed_body() {
        let (url, _) = serve("  new-token-value\n").await;
        let manager = TokenManager::new(url, "", reqwest::Client::new());
        manager.refresh().await.unwrap();
        assert_eq!(manager.token(), "new-token-value");
    }

    #[tokio::test]
    async fn refresh_rejects_empty_body() {
        let (url, _) = serve("   \n").await;
        let manager = TokenManager::new(url, "", reqwest::Client::new());
        assert!(matches!(manager.refresh().await, Err(TokenError::EmptyToken)));
    }

    #[tokio::test]
    async fn refresh_without_url_is_a_config_error() {
        let manager = TokenManager::new("", "", reqwest::Client::new());
        assert!(matches!(manager.refresh().await, Err(TokenError::NoRefreshUrl)));
    }

    #[tokio::test]
    async fn heartbeat_round_trips() {
        let (url, hits) = serve("ok").await;
        let manager = TokenManager::new("", url, reqwest::Client::new());
        manager.set_token(make_jwt(r#"{"exp":9999999999}"#));
        manager.send_heartbeat().await.unwrap();
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_before_start_prevents_launch() {
        let (url, hits) = serve("token").await;
        let manager = Arc::new(TokenManager::new(url, "", reqwest::Client::new()));
        manager.stop();
        manager.start_auto_refresh(Duration::from_millis(5), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_refresh_renews_missing_token() {
        let (url, _) = serve("fresh-token").await;
        let manager = Arc::new(TokenManager::new(url, "", reqwest::Client::new()));
        manager.start_auto_refresh(Duration::from_millis(5), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.stop();
        assert_eq!(manager.token(), "fresh-token");
    }
}
