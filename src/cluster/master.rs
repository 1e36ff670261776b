//! Cluster master: Global Cookie Jar, session-status registry, and the
//! streaming cookie fan-out.
//!
//! One master process coordinates every worker node. A worker that solves a
//! challenge uploads its cookies; the master stores them in the versioned
//! jar and pushes the new snapshot to every watch subscriber within one
//! round-trip. Fan-out is non-blocking by contract: a slow subscriber loses
//! pushes (it can resynchronise with a snapshot request) but never stalls
//! the broadcaster.
//!
//! Jar reads never block each other; status updates go through a concurrent
//! map with last-writer-wins semantics per session id; the subscriber table
//! is touched only on broadcast and connect/disconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use prost::Message;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::proto::{
    BroadcastCookieRequest, BroadcastCookieResponse, Cookie, ErrorCode, GetAllStatusResponse,
    GetGlobalCookiesResponse, Request, RequestKind, Response, ResponseKind, RpcError,
    SessionStatus, UpdateStatusRequest, UpdateStatusResponse,
};

/// Buffered pushes per watch subscriber before drops kick in.
const SUBSCRIBER_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("master listen {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

fn invalid_argument(message: &str) -> RpcError {
    RpcError {
        code: ErrorCode::InvalidArgument as i32,
        message: message.to_string(),
    }
}

struct JarEntry {
    cookie: Cookie,
    #[allow(dead_code)]
    stored_at: chrono::DateTime<Utc>,
}

/// Versioned, name-keyed cookie store shared across the cluster.
///
/// Store-by-name: a later broadcast of the same cookie name replaces the
/// older record. The version advances exactly once per store, inside the
/// write lock, so snapshots always observe a consistent ⟨cookies, version⟩
/// pair. Expired cookies are filtered on read, never on store.
pub struct GlobalCookieJar {
    entries: RwLock<HashMap<String, JarEntry>>,
    version: AtomicI64,
}

impl GlobalCookieJar {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            version: AtomicI64::new(0),
        }
    }

    /// Saves the broadcast cookies and returns the new jar version.
    pub fn store(&self, cookies: &[Cookie]) -> i64 {
        let mut guard = self.entries.write().expect("jar lock poisoned");
        for cookie in cookies {
            guard.insert(
                cookie.name.clone(),
                JarEntry {
                    cookie: cookie.clone(),
                    stored_at: Utc::now(),
                },
            );
        }
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Atomic snapshot of the live (non-expired) cookies and the current
    /// version.
    pub fn snapshot(&self) -> (Vec<Cookie>, i64) {
        let guard = self.entries.read().expect("jar lock poisoned");
        let now = Utc::now().timestamp();
        let cookies = guard
            .values()
            .filter(|entry| !entry.cookie.is_expired(now))
            .map(|entry| entry.cookie.clone())
            .collect();
        let version = self.version.load(Ordering::SeqCst);
        (cookies, version)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("jar lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for GlobalCookieJar {
    fn default() -> Self {
        Self::new()
    }
}

/// The master's RPC surface, transport-independent. [`serve`] exposes it
/// over framed TCP; tests may call the methods in-process.
pub struct MasterService {
    jar: GlobalCookieJar,
    sessions: DashMap<i32, SessionStatus>,
    subscribers: Mutex<HashMap<String, mpsc::Sender<GetGlobalCookiesResponse>>>,
}

impl MasterService {
    pub fn new() -> Self {
        Self {
            jar: GlobalCookieJar::new(),
            sessions: DashMap::new(),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// The jar, for in-process consumers and tests.
    pub fn jar(&self) -> &GlobalCookieJar {
        &self.jar
    }

    /// Stores the cookies and fans the fresh snapshot out to every
    /// subscriber. Rejects empty cookie lists. Slow subscribers are
    /// skipped, not awaited.
    pub fn broadcast_cookie(
        &self,
        request: BroadcastCookieRequest,
    ) -> Result<BroadcastCookieResponse, RpcError> {
        if request.cookies.is_empty() {
            return Err(invalid_argument("cookies must not be empty"));
        }

        self.jar.store(&request.cookies);
        let (cookies, version) = self.jar.snapshot();
        let update = GetGlobalCookiesResponse { cookies, version };

        let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        for (pc_id, sender) in subscribers.iter() {
            if sender.try_send(update.clone()).is_err() {
                log::debug!("subscriber {pc_id} is slow; dropping jar update v{version}");
            }
        }

        Ok(BroadcastCookieResponse { accepted: true })
    }

    /// Records the latest lifecycle state for a session. Last writer wins
    /// per session id.
    pub fn update_status(&self, request: UpdateStatusRequest) -> Result<UpdateStatusResponse, RpcError> {
        let status = request
            .status
            .ok_or_else(|| invalid_argument("status must not be null"))?;
        self.sessions.insert(status.session_id, status);
        Ok(UpdateStatusResponse { ok: true })
    }

    pub fn get_global_cookies(&self) -> GetGlobalCookiesResponse {
        let (cookies, version) = self.jar.snapshot();
        GetGlobalCookiesResponse { cookies, version }
    }

    pub fn get_all_status(&self) -> GetAllStatusResponse {
        GetAllStatusResponse {
            sessions: self.sessions.iter().map(|entry| entry.value().clone()).collect(),
        }
    }

    /// Registers a watch subscriber and returns its initial snapshot plus
    /// the push channel. Registration happens before the snapshot is taken,
    /// so every store completing after this call is either in the snapshot
    /// or delivered as a push (or both, when it races the snapshot).
    fn subscribe(
        &self,
        pc_id: &str,
    ) -> Result<(GetGlobalCookiesResponse, mpsc::Receiver<GetGlobalCookiesResponse>), RpcError> {
        if pc_id.is_empty() {
            return Err(invalid_argument("pc_id must not be empty"));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(pc_id.to_string(), tx);
        Ok((self.get_global_cookies(), rx))
    }

    fn unsubscribe(&self, pc_id: &str) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .remove(pc_id);
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber lock poisoned").len()
    }
}

impl Default for MasterService {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds `addr` and serves the master until `cancel` fires.
pub async fn listen_and_serve(
    addr: &str,
    service: Arc<MasterService>,
    cancel: CancellationToken,
) -> Result<(), MasterError> {
    let listener = TcpListener::bind(addr).await.map_err(|source| MasterError::Listen {
        addr: addr.to_string(),
        source,
    })?;
    log::info!("master listening on {addr}");
    serve(listener, service, cancel).await;
    Ok(())
}

/// Accept loop over an already-bound listener. Each connection is handled
/// on its own task; the loop exits when `cancel` fires.
pub async fn serve(listener: TcpListener, service: Arc<MasterService>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { return };
                log::debug!("master: connection from {peer}");
                let service = service.clone();
                let cancel = cancel.clone();
                tokio::spawn(handle_connection(stream, service, cancel));
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, service: Arc<MasterService>, cancel: CancellationToken) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = framed.next() => frame,
        };
        let Some(Ok(bytes)) = frame else {
            return; // client disconnected or framing error
        };
        let request = match Request::decode(bytes.as_ref()) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("master: undecodable request frame: {err}");
                return;
            }
        };

        let kind = match request.kind {
            Some(kind) => kind,
            None => continue,
        };

        match kind {
            RequestKind::WatchCookies(watch) => {
                // The connection becomes a dedicated stream; it ends on
                // cancel, client disconnect, or send failure.
                watch_loop(&mut framed, &service, &watch.pc_id, &cancel).await;
                return;
            }
            unary => {
                let response = dispatch_unary(&service, unary);
                if send_response(&mut framed, response).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn dispatch_unary(service: &MasterService, kind: RequestKind) -> Response {
    let kind = match kind {
        RequestKind::BroadcastCookie(request) => match service.broadcast_cookie(request) {
            Ok(response) => ResponseKind::BroadcastCookie(response),
            Err(err) => ResponseKind::Error(err),
        },
        RequestKind::UpdateStatus(request) => match service.update_status(request) {
            Ok(response) => ResponseKind::UpdateStatus(response),
            Err(err) => ResponseKind::Error(err),
        },
        RequestKind::GetGlobalCookies(_) => {
            ResponseKind::GetGlobalCookies(service.get_global_cookies())
        }
        RequestKind::GetAllStatus(_) => ResponseKind::GetAllStatus(service.get_all_status()),
        RequestKind::WatchCookies(_) => unreachable!("watch handled by the stream path"),
    };
    Response { kind: Some(kind) }
}

async fn watch_loop(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    service: &MasterService,
    pc_id: &str,
    cancel: &CancellationToken,
) {
    let (initial, mut rx) = match service.subscribe(pc_id) {
        Ok(subscription) => subscription,
        Err(err) => {
            let _ = send_response(
                framed,
                Response {
                    kind: Some(ResponseKind::Error(err)),
                },
            )
            .await;
            return;
        }
    };

    // Initial snapshot first, so the subscriber is synchronised before any
    // concurrent broadcast reaches it.
    if send_update(framed, initial).await.is_err() {
        service.unsubscribe(pc_id);
        return;
    }

    enum WatchEvent {
        Cancelled,
        Update(Option<GetGlobalCookiesResponse>),
        Inbound(bool),
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => WatchEvent::Cancelled,
            update = rx.recv() => WatchEvent::Update(update),
            inbound = framed.next() => WatchEvent::Inbound(inbound.is_some()),
        };
        match event {
            WatchEvent::Cancelled => break,
            WatchEvent::Update(None) => break,
            WatchEvent::Update(Some(update)) => {
                if send_update(framed, update).await.is_err() {
                    break;
                }
            }
            // EOF on a watch stream means the client is done; stray inbound
            // frames are ignored.
            WatchEvent::Inbound(false) => break,
            WatchEvent::Inbound(true) => {}
        }
    }
    service.unsubscribe(pc_id);
}

async fn send_update(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    update: GetGlobalCookiesResponse,
) -> Result<(), std::io::Error> {
    send_response(
        framed,
        Response {
            kind: Some(ResponseKind::CookieUpdate(update)),
        },
    )
    .await
}

async fn send_response(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    response: Response,
) -> Result<(), std::io::Error> {
    framed.send(Bytes::from(response.encode_to_vec())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, value: &str, expires_unix: i64) -> Cookie {
        Cookie {
            name: name.into(),
            value: value.into(),
            domain: ".example.com".into(),
            path: "/".into(),
            expires_unix,
            secure: false,
            http_only: false,
        }
    }

    #[test]
    fn store_advances_version_once_per_call() {
        let jar = GlobalCookieJar::new();
        assert_eq!(jar.store(&[cookie("a", "1", 0)]), 1);
        assert_eq!(jar.store(&[cookie("b", "2", 0), cookie("c", "3", 0)]), 2);
        let (cookies, version) = jar.snapshot();
        assert_eq!(cookies.len(), 3);
        assert_eq!(version, 2);
    }

    #[test]
    fn later_store_replaces_same_name() {
        let jar = GlobalCookieJar::new();
        jar.store(&[cookie("sid", "old", 0)]);
        jar.store(&[cookie("sid", "new", 0)]);
        let (cookies, _) = jar.snapshot();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value, "new");
    }

    #[test]
    fn expired_cookies_filtered_on_read_not_store() {
        let jar = GlobalCookieJar::new();
        jar.store(&[cookie("live", "1", 0), cookie("dead", "2", 1)]);
        assert_eq!(jar.len(), 2, "store keeps expired entries");
        let (cookies, _) = jar.snapshot();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "live");
    }

    #[test]
    fn broadcast_rejects_empty_cookie_list() {
        let service = MasterService::new();
        let err = service
            .broadcast_cookie(BroadcastCookieRequest {
                pc_id: "pc-1".into(),
                session_id: 0,
                cookies: vec![],
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument as i32);
    }

    #[test]
    fn update_status_rejects_null_and_keeps_last_writer() {
        let service = MasterService::new();
        let err = service.update_status(UpdateStatusRequest { status: None }).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument as i32);

        for state in ["idle", "active", "challenge"] {
            service
                .update_status(UpdateStatusRequest {
                    status: Some(SessionStatus {
                        session_id: 7,
                        pc_id: "pc-2".into(),
                        state: state.into(),
                    }),
                })
                .unwrap();
        }
        let all = service.get_all_status();
        assert_eq!(all.sessions.len(), 1);
        assert_eq!(all.sessions[0].state, "challenge");
    }

    #[test]
    fn subscribe_rejects_empty_pc_id() {
        let service = MasterService::new();
        assert!(service.subscribe("").is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_updates_without_blocking() {
        let service = MasterService::new();
        let (initial, mut rx) = service.subscribe("pc-slow").unwrap();
        assert_eq!(initial.version, 0);

        // Nobody drains rx: overflow past the buffer must not block.
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            service
                .broadcast_cookie(BroadcastCookieRequest {
                    pc_id: "pc-1".into(),
                    session_id: 0,
                    cookies: vec![cookie("c", &i.to_string(), 0)],
                })
                .unwrap();
        }
        assert_eq!(service.subscriber_count(), 1, "slow subscriber stays connected");

        // The buffered prefix is still delivered in order.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.version, 1);
    }

    #[tokio::test]
    async fn registered_subscriber_sees_post_registration_stores() {
        let service = MasterService::new();
        let (_initial, mut rx) = service.subscribe("pc-b").unwrap();
        service
            .broadcast_cookie(BroadcastCookieRequest {
                pc_id: "pc-a".into(),
                session_id: 3,
                cookies: vec![cookie("_abck", "sentinel", 0)],
            })
            .unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.version, 1);
        assert_eq!(update.cookies.len(), 1);
        assert_eq!(update.cookies[0].value, "sentinel");
    }
}
