//! Per-connection lifetime bookkeeping (spec §3 "Connection", §4.6).

mod manager;

pub use manager::ConnectionManager;

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::scope::{HttpVersion, SocketAddrPair};

/// A connection's unique id within this process's lifetime.
pub type ConnectionId = u64;

/// Which protocol role a connection currently plays. A WebSocket cycle
/// cannot coexist with an HTTP request cycle on the same connection (spec
/// §3 invariant), so this is a single, swappable field rather than a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Http1,
    Http2,
    WebSocket,
}

/// The data spec §3 says a `Connection` record holds.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub remote: Option<SocketAddrPair>,
    pub local: Option<SocketAddrPair>,
    pub tls: bool,
    pub http_version: HttpVersion,
    pub role: Role,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        remote: Option<SocketAddrPair>,
        local: Option<SocketAddrPair>,
        tls: bool,
        http_version: HttpVersion,
        role: Role,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote,
            local,
            tls,
            http_version,
            role,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// A registered connection's handle: the token an application task and its
/// protocol loop both watch, and can both be cancelled through by the
/// [`ConnectionManager`] on shutdown or a protocol-level abort decision.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Cancelled when the server begins shutdown, or when this specific
    /// connection is forcibly torn down (timeout, protocol violation).
    /// WebSocket cycles treat cancellation during normal operation as "send
    /// a graceful close 1001 and finish"; HTTP cycles treat it as "abort".
    pub cancellation: CancellationToken,
}
