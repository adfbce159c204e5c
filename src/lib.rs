//! Core of an ASGI-compatible protocol server.
//!
//! This crate terminates HTTP/1.1, HTTP/2 and WebSocket connections and
//! exposes each one to a server-side application as the ASGI three-function
//! contract: an immutable connection [`scope`], a `receive` endpoint that
//! yields inbound events, and a `send` endpoint that accepts outbound ones.
//!
//! The crate does not parse command-line arguments, format access logs, load
//! TLS certificates from disk, or import an application by dotted name —
//! those are the job of a front-end binary. What it does own is everything
//! between an accepted transport and the [`app::Application`] callable:
//! request/response framing, WebSocket handshake and frame codec, timeouts,
//! and per-connection lifetime.
//!
//! # Layout
//!
//! - [`endpoint`] / [`listener`] — what to listen on, and how transports are
//!   accepted.
//! - [`http`] — the HTTP/1.1 and HTTP/2 request cycle.
//! - [`websocket`] — the WebSocket handshake and frame cycle.
//! - [`scope`] / [`event`] / [`bridge`] — the ASGI contract itself.
//! - [`connection`] — per-connection lifetime, timeouts, active-set
//!   bookkeeping.
//! - [`server`] — shared configuration and orchestration.

mod access_log;
pub mod app;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod headers;
#[cfg(any(feature = "http1", feature = "http2"))]
pub mod http;
pub mod listener;
pub mod scope;
pub mod server;
#[cfg(feature = "tls")]
pub mod tls;
#[cfg(feature = "ws")]
pub mod websocket;

pub use access_log::{AccessLogEvent, AccessLogSink};
pub use config::ServerConfig;
pub use error::{Error, ErrorKind, TimeoutKind};
pub use server::Server;
