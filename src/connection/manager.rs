//! The connection manager (spec §4.6).
//!
//! Grounded on `axum::serve`'s graceful-shutdown implementation: a
//! `tokio_util::sync::CancellationToken` per connection (child of a
//! server-wide token, same relationship `axum`'s `serve/connection/hyper.rs`
//! gives its per-connection `shutdown: CancellationToken`), plus a count of
//! still-registered connections polled against a grace period instead of
//! `axum`'s `watch::Sender::closed()` trick — this manager needs to act
//! (send WebSocket 1001s) partway through shutdown, not just wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Connection, ConnectionHandle, ConnectionId};

struct Entry {
    connection: Connection,
    handle: ConnectionHandle,
}

/// Owns the active-connections set (spec §4.6): records each accepted
/// connection, arms/rearms its timers via the caller, and drives shutdown.
pub struct ConnectionManager {
    active: Mutex<HashMap<ConnectionId, Entry>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Allocate the next connection id. Monotonic within a process, never
    /// reused, per spec §3 "Unique id".
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a newly accepted connection and return its cancellation
    /// handle. The caller arms the connect-timeout itself (spec step 1);
    /// the manager only tracks membership and cancellation.
    pub fn register(&self, connection: Connection) -> ConnectionHandle {
        let handle = ConnectionHandle {
            id: connection.id,
            cancellation: self.shutdown.child_token(),
        };
        let entry = Entry {
            connection,
            handle: handle.clone(),
        };
        self.active.lock().unwrap().insert(entry.connection.id, entry);
        handle
    }

    /// Remove a connection once its transport is closed and its
    /// application task has completed (spec §3 "Connection... destroyed
    /// when both the transport is closed AND the application task has
    /// completed").
    pub fn deregister(&self, id: ConnectionId) {
        self.active.lock().unwrap().remove(&id);
    }

    /// Update a connection's role after a protocol upgrade (e.g. HTTP
    /// request cycle that turned into a WebSocket cycle).
    pub fn set_role(&self, id: ConnectionId, role: super::Role) {
        if let Some(entry) = self.active.lock().unwrap().get_mut(&id) {
            entry.connection.role = role;
            entry.connection.touch();
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// True once the server has begun shutting down; WebSocket cycles poll
    /// this (via their handle's token) to know to send a graceful close.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Orchestrate shutdown (spec §4.6 step 4): stop accepting (the
    /// listener loop is expected to already have stopped by the time this
    /// is called), cancel every connection's token so WebSocket cycles send
    /// their graceful close and HTTP cycles are told to wind down, wait up
    /// to `grace_period` for the active set to drain, then report whatever
    /// is still outstanding so the caller can abort those transports.
    pub async fn shutdown(&self, grace_period: Duration) -> Vec<ConnectionId> {
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + grace_period;
        loop {
            if self.active_count() == 0 {
                return Vec::new();
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.active.lock().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::HttpVersion;

    fn dummy_connection(id: ConnectionId) -> Connection {
        Connection::new(id, None, None, false, HttpVersion::Http1_1, super::super::Role::Http1)
    }

    #[test]
    fn register_and_deregister_tracks_active_count() {
        let manager = ConnectionManager::new();
        let id = manager.next_id();
        manager.register(dummy_connection(id));
        assert_eq!(manager.active_count(), 1);
        manager.deregister(id);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_when_connections_deregister_in_time() {
        let manager = std::sync::Arc::new(ConnectionManager::new());
        let id = manager.next_id();
        let handle = manager.register(dummy_connection(id));
        assert!(!handle.cancellation.is_cancelled());

        let manager_clone = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager_clone.deregister(id);
        });

        let remaining = manager.shutdown(Duration::from_millis(500)).await;
        assert!(remaining.is_empty());
        assert!(handle.cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_reports_survivors_past_grace_period() {
        let manager = ConnectionManager::new();
        let id = manager.next_id();
        manager.register(dummy_connection(id));

        let remaining = manager.shutdown(Duration::from_millis(20)).await;
        assert_eq!(remaining, vec![id]);
    }
}
