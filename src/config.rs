//! Server-wide configuration (spec §4.7, §6).
//!
//! `ServerConfig` is the single struct an external CLI front-end populates
//! and hands to [`crate::Server`]; this crate never parses `argv` itself
//! (spec §1 lists the CLI as an out-of-scope collaborator).

use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::headers::ProxyHeaderConfig;

/// Default value for `--server-name`. Empty disables the `Server` header.
pub const DEFAULT_SERVER_NAME: &str = "daphne";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listeners: Vec<Endpoint>,

    /// Fallback root path applied when no request carries a
    /// `Daphne-Root-Path` header. A CLI front-end is expected to seed this
    /// from `--root-path`, falling back itself to the `DAPHNE_ROOT_PATH`
    /// environment variable when neither is given.
    pub root_path: String,

    /// `Server` header value; empty disables the header entirely (spec §8
    /// invariant: "the `Server` header appears iff the configured server
    /// name is non-empty").
    pub server_name: String,

    /// Per-request timeout: cancels the application task with a 503 if
    /// `http.response.start` is not received in time. `None` disables it
    /// (the default).
    pub http_response_start_timeout: Option<Duration>,

    /// WebSocket handshake timeout: force-closes the connection if the
    /// application hasn't replied to `websocket.connect` in time.
    pub websocket_handshake_timeout: Duration,

    /// Deadline for the initial bytes from a newly accepted transport.
    pub connect_timeout: Duration,

    /// Idle-keepalive timeout: closes an HTTP/1.1 keep-alive connection
    /// that produces no bytes for this long.
    pub idle_timeout: Option<Duration>,

    /// How long a cancelled application task is given to return before
    /// being forcibly dropped.
    pub application_close_timeout: Duration,

    /// WebSocket keepalive ping cadence.
    pub ping_interval: Duration,

    /// WebSocket keepalive: close with 1011 if no incoming data arrives
    /// within this window, measured independently of outgoing traffic.
    pub ping_timeout: Duration,

    /// Maximum age of an open WebSocket before a group-expiry close (code
    /// 1000) is sent; `None` disables the cap.
    pub websocket_max_age: Option<Duration>,

    /// Maximum reassembled WebSocket message size in bytes before a close
    /// 1009 and termination.
    pub websocket_max_message_size: usize,

    pub proxy_headers: ProxyHeaderConfig,

    /// Grace period on shutdown: how long in-flight responses get to flush
    /// before remaining tasks are cancelled and transports aborted.
    pub shutdown_grace_period: Duration,

    /// Global concurrency cap across all listeners; `None` is unbounded.
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            root_path: String::new(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            http_response_start_timeout: None,
            websocket_handshake_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(20),
            idle_timeout: None,
            application_close_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(30),
            websocket_max_age: None,
            websocket_max_message_size: 16 * 1024 * 1024,
            proxy_headers: ProxyHeaderConfig::default(),
            shutdown_grace_period: Duration::from_secs(15),
            max_connections: None,
        }
    }
}

impl ServerConfig {
    /// Whether the `Server` header should be emitted at all.
    pub fn emits_server_header(&self) -> bool {
        !self.server_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_name_is_daphne() {
        let config = ServerConfig::default();
        assert_eq!(config.server_name, "daphne");
        assert!(config.emits_server_header());
    }

    #[test]
    fn empty_server_name_disables_header() {
        let mut config = ServerConfig::default();
        config.server_name.clear();
        assert!(!config.emits_server_header());
    }
}
