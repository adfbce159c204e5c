//! ASGI scope records (spec §3 "Request cycle", §4.2 "Scope construction").
//!
//! A scope is built once per cycle and never mutated afterwards; it is handed
//! to the application alongside the `receive`/`send` endpoints.

use std::net::IpAddr;

use bytes::Bytes;

use crate::event::HeaderPair;

/// `asgi["version"]`, fixed per spec §4.2.
pub const ASGI_VERSION: &str = "3.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// `client`/`server` address pairs, as carried in an ASGI scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddrPair {
    pub ip: IpAddr,
    pub port: u16,
}

/// The HTTP version negotiated for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http1_1,
    Http2,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http1_1 => "1.1",
            HttpVersion::Http2 => "2",
        }
    }
}

/// An `http` scope (spec §4.2).
#[derive(Debug, Clone)]
pub struct HttpScope {
    pub http_version: HttpVersion,
    pub method: String,
    pub scheme: Scheme,
    /// Percent-decoded, UTF-8, with `root_path` already stripped.
    pub path: String,
    /// Undecoded path bytes, exactly as received.
    pub raw_path: Bytes,
    /// Raw (undecoded) query string bytes, no leading `?`.
    pub query_string: Bytes,
    pub root_path: String,
    /// Lowercased names, verbatim values, received order. Never contains
    /// the reserved `Daphne-Root-Path` header.
    pub headers: Vec<HeaderPair>,
    pub client: Option<SocketAddrPair>,
    pub server: Option<SocketAddrPair>,
}

/// A `websocket` scope (spec §4.4): same keys as [`HttpScope`] minus
/// `method`, plus `subprotocols`.
#[derive(Debug, Clone)]
pub struct WebSocketScope {
    pub http_version: HttpVersion,
    pub scheme: Scheme,
    pub path: String,
    pub raw_path: Bytes,
    pub query_string: Bytes,
    pub root_path: String,
    pub headers: Vec<HeaderPair>,
    pub client: Option<SocketAddrPair>,
    pub server: Option<SocketAddrPair>,
    pub subprotocols: Vec<String>,
}

impl WebSocketScope {
    /// The scheme an application typically expects for a WebSocket scope
    /// (`ws`/`wss`), derived from the transport's HTTP scheme.
    pub fn ws_scheme(&self) -> &'static str {
        match self.scheme {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        }
    }
}

/// Either scope flavor a connection can produce, used where both cycle
/// kinds share code (e.g. the connection manager's active-connections set).
#[derive(Debug, Clone)]
pub enum Scope {
    Http(HttpScope),
    WebSocket(WebSocketScope),
}
