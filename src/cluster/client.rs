//! Worker-side façade over the master RPCs.
//!
//! Each worker node creates exactly one client (pointing at the master's
//! address) and shares it across all local sessions. Unary calls are
//! serialised over one connection; `watch_cookies` opens a dedicated stream
//! connection and invokes the caller's handler synchronously per push — a
//! slow handler delays subsequent updates by design, leaving the threading
//! model to the caller.

use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use prost::Message;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::proto::{
    BroadcastCookieRequest, Cookie, GetAllStatusResponse, GetGlobalCookiesRequest, Request,
    RequestKind, Response, ResponseKind, SessionStatus, UpdateStatusRequest, WatchCookiesRequest,
};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("dial master {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cluster I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode master response: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("master rejected request (code {code}): {message}")]
    Rpc { code: i32, message: String },
    #[error("broadcast rejected by master")]
    Rejected,
    #[error("connection closed by master")]
    Closed,
    #[error("unexpected response type from master")]
    Unexpected,
}

type Conn = Framed<TcpStream, LengthDelimitedCodec>;

/// Client for the master control plane. Safe for concurrent use.
pub struct WorkerClient {
    pc_id: String,
    addr: String,
    conn: Mutex<Conn>,
}

impl WorkerClient {
    /// Dials the master at `addr`. `pc_id` identifies this worker node
    /// (e.g. "pc-1"). The connection is plain TCP, which is appropriate for
    /// a trusted LAN.
    pub async fn connect(pc_id: impl Into<String>, addr: impl Into<String>) -> Result<Self, ClusterError> {
        let addr = addr.into();
        let conn = dial(&addr).await?;
        Ok(Self {
            pc_id: pc_id.into(),
            addr,
            conn: Mutex::new(conn),
        })
    }

    pub fn pc_id(&self) -> &str {
        &self.pc_id
    }

    /// Reports a session lifecycle transition to the master.
    pub async fn report_status(&self, session_id: i32, state: &str) -> Result<(), ClusterError> {
        let response = self
            .call(RequestKind::UpdateStatus(UpdateStatusRequest {
                status: Some(SessionStatus {
                    session_id,
                    pc_id: self.pc_id.clone(),
                    state: state.to_string(),
                }),
            }))
            .await?;
        match response {
            ResponseKind::UpdateStatus(r) if r.ok => Ok(()),
            ResponseKind::UpdateStatus(_) => Err(ClusterError::Rejected),
            ResponseKind::Error(err) => Err(ClusterError::Rpc {
                code: err.code,
                message: err.message,
            }),
            _ => Err(ClusterError::Unexpected),
        }
    }

    /// Uploads cookies obtained after solving a challenge. The master
    /// stores them in the Global Cookie Jar and pushes them to every watch
    /// subscriber. Cookies that are already expired are skipped on the way
    /// out.
    pub async fn broadcast_cookies(&self, session_id: i32, cookies: &[Cookie]) -> Result<(), ClusterError> {
        let now = Utc::now().timestamp();
        let cookies: Vec<Cookie> = cookies
            .iter()
            .filter(|cookie| !cookie.is_expired(now))
            .cloned()
            .collect();

        let response = self
            .call(RequestKind::BroadcastCookie(BroadcastCookieRequest {
                pc_id: self.pc_id.clone(),
                session_id,
                cookies,
            }))
            .await?;
        match response {
            ResponseKind::BroadcastCookie(r) if r.accepted => Ok(()),
            ResponseKind::BroadcastCookie(_) => Err(ClusterError::Rejected),
            ResponseKind::Error(err) => Err(ClusterError::Rpc {
                code: err.code,
                message: err.message,
            }),
            _ => Err(ClusterError::Unexpected),
        }
    }

    /// Fetches the current Global Cookie Jar snapshot.
    pub async fn get_cookies(&self) -> Result<(Vec<Cookie>, i64), ClusterError> {
        let response = self
            .call(RequestKind::GetGlobalCookies(GetGlobalCookiesRequest {
                pc_id: self.pc_id.clone(),
            }))
            .await?;
        match response {
            ResponseKind::GetGlobalCookies(r) => Ok((r.cookies, r.version)),
            ResponseKind::Error(err) => Err(ClusterError::Rpc {
                code: err.code,
                message: err.message,
            }),
            _ => Err(ClusterError::Unexpected),
        }
    }

    /// Snapshot of every session the master tracks.
    pub async fn get_all_status(&self) -> Result<GetAllStatusResponse, ClusterError> {
        let response = self
            .call(RequestKind::GetAllStatus(super::proto::GetAllStatusRequest {}))
            .await?;
        match response {
            ResponseKind::GetAllStatus(r) => Ok(r),
            ResponseKind::Error(err) => Err(ClusterError::Rpc {
                code: err.code,
                message: err.message,
            }),
            _ => Err(ClusterError::Unexpected),
        }
    }

    /// Opens a streaming subscription on a dedicated connection and spawns
    /// one reader task that calls `on_update` with each ⟨cookies, version⟩
    /// push, starting with the initial snapshot. The task exits when
    /// `cancel` fires or the stream errors.
    pub async fn watch_cookies<F>(
        &self,
        cancel: CancellationToken,
        on_update: F,
    ) -> Result<JoinHandle<()>, ClusterError>
    where
        F: Fn(Vec<Cookie>, i64) + Send + 'static,
    {
        let mut stream = dial(&self.addr).await?;
        send_request(
            &mut stream,
            RequestKind::WatchCookies(WatchCookiesRequest {
                pc_id: self.pc_id.clone(),
            }),
        )
        .await?;

        let pc_id = self.pc_id.clone();
        Ok(tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = stream.next() => frame,
                };
                let Some(Ok(bytes)) = frame else {
                    return; // stream closed or broken
                };
                let response = match Response::decode(bytes.as_ref()) {
                    Ok(response) => response,
                    Err(err) => {
                        log::warn!("watch {pc_id}: undecodable frame: {err}");
                        return;
                    }
                };
                match response.kind {
                    Some(ResponseKind::CookieUpdate(update)) => {
                        on_update(update.cookies, update.version);
                    }
                    Some(ResponseKind::Error(err)) => {
                        log::warn!("watch {pc_id}: master error {}: {}", err.code, err.message);
                        return;
                    }
                    _ => {}
                }
            }
        }))
    }

    async fn call(&self, kind: RequestKind) -> Result<ResponseKind, ClusterError> {
        let mut conn = self.conn.lock().await;
        send_request(&mut conn, kind).await?;
        let frame = conn.next().await.ok_or(ClusterError::Closed)??;
        let response = Response::decode(frame.as_ref())?;
        response.kind.ok_or(ClusterError::Unexpected)
    }
}

async fn dial(addr: &str) -> Result<Conn, ClusterError> {
    let stream = TcpStream::connect(addr).await.map_err(|source| ClusterError::Connect {
        addr: addr.to_string(),
        source,
    })?;
    Ok(Framed::new(stream, LengthDelimitedCodec::new()))
}

async fn send_request(conn: &mut Conn, kind: RequestKind) -> Result<(), ClusterError> {
    let request = Request { kind: Some(kind) };
    conn.send(Bytes::from(request.encode_to_vec())).await?;
    Ok(())
}
