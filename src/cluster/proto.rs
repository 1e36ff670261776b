//! Wire messages for the master/worker control plane.
//!
//! Messages are prost-derived so the schema lives in Rust; any transport
//! that can carry length-delimited protobuf frames can speak this protocol.
//! Requests and responses are wrapped in oneof envelopes so a single framed
//! stream multiplexes every RPC.

use prost::{Message, Oneof};

/// One cookie record as shared through the Global Cookie Jar.
#[derive(Clone, PartialEq, Message)]
pub struct Cookie {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
    #[prost(string, tag = "3")]
    pub domain: String,
    #[prost(string, tag = "4")]
    pub path: String,
    /// Unix seconds; 0 means a session cookie.
    #[prost(int64, tag = "5")]
    pub expires_unix: i64,
    #[prost(bool, tag = "6")]
    pub secure: bool,
    #[prost(bool, tag = "7")]
    pub http_only: bool,
}

impl Cookie {
    /// True when the cookie carries a non-zero expiry in the past.
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expires_unix > 0 && self.expires_unix < now_unix
    }

    /// Renders the cookie as a `Set-Cookie`-style string suitable for
    /// injection into a session cookie jar.
    pub fn to_set_cookie_string(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if !self.domain.is_empty() {
            out.push_str("; Domain=");
            out.push_str(&self.domain);
        }
        if !self.path.is_empty() {
            out.push_str("; Path=");
            out.push_str(&self.path);
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

/// Lifecycle report for one session.
#[derive(Clone, PartialEq, Message)]
pub struct SessionStatus {
    #[prost(int32, tag = "1")]
    pub session_id: i32,
    #[prost(string, tag = "2")]
    pub pc_id: String,
    /// One of "idle", "active", "challenge", "closed".
    #[prost(string, tag = "3")]
    pub state: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct BroadcastCookieRequest {
    #[prost(string, tag = "1")]
    pub pc_id: String,
    #[prost(int32, tag = "2")]
    pub session_id: i32,
    #[prost(message, repeated, tag = "3")]
    pub cookies: Vec<Cookie>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BroadcastCookieResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct UpdateStatusRequest {
    #[prost(message, optional, tag = "1")]
    pub status: Option<SessionStatus>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UpdateStatusResponse {
    #[prost(bool, tag = "1")]
    pub ok: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetGlobalCookiesRequest {
    #[prost(string, tag = "1")]
    pub pc_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetGlobalCookiesResponse {
    #[prost(message, repeated, tag = "1")]
    pub cookies: Vec<Cookie>,
    #[prost(int64, tag = "2")]
    pub version: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct WatchCookiesRequest {
    #[prost(string, tag = "1")]
    pub pc_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetAllStatusRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct GetAllStatusResponse {
    #[prost(message, repeated, tag = "1")]
    pub sessions: Vec<SessionStatus>,
}

/// RPC failure codes, mirroring the gRPC numeric space for the two codes
/// this protocol uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    Cancelled = 1,
    InvalidArgument = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct RpcError {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Client-to-master envelope.
#[derive(Clone, PartialEq, Message)]
pub struct Request {
    #[prost(oneof = "RequestKind", tags = "1, 2, 3, 4, 5")]
    pub kind: Option<RequestKind>,
}

#[derive(Clone, PartialEq, Oneof)]
pub enum RequestKind {
    #[prost(message, tag = "1")]
    BroadcastCookie(BroadcastCookieRequest),
    #[prost(message, tag = "2")]
    UpdateStatus(UpdateStatusRequest),
    #[prost(message, tag = "3")]
    GetGlobalCookies(GetGlobalCookiesRequest),
    #[prost(message, tag = "4")]
    WatchCookies(WatchCookiesRequest),
    #[prost(message, tag = "5")]
    GetAllStatus(GetAllStatusRequest),
}

/// Master-to-client envelope. `CookieUpdate` frames are pushed on watch
/// streams; everything else answers a unary request.
#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(oneof = "ResponseKind", tags = "1, 2, 3, 4, 5, 6")]
    pub kind: Option<ResponseKind>,
}

#[derive(Clone, PartialEq, Oneof)]
pub enum ResponseKind {
    #[prost(message, tag = "1")]
    BroadcastCookie(BroadcastCookieResponse),
    #[prost(message, tag = "2")]
    UpdateStatus(UpdateStatusResponse),
    #[prost(message, tag = "3")]
    GetGlobalCookies(GetGlobalCookiesResponse),
    #[prost(message, tag = "4")]
    CookieUpdate(GetGlobalCookiesResponse),
    #[prost(message, tag = "5")]
    GetAllStatus(GetAllStatusResponse),
    #[prost(message, tag = "6")]
    Error(RpcError),
}
