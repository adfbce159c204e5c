//! The WebSocket protocol (spec §4.4): RFC 6455 handshake and frame cycle.
//!
//! Wire framing is delegated to `tokio-tungstenite`, the same crate the
//! teacher's `extract/ws.rs` drives via `WebSocketStream::from_raw_socket`;
//! this module supplies the ASGI-shaped handshake and scope/event adapter
//! around it.

pub mod cycle;
pub mod handshake;

pub use cycle::drive_websocket_cycle;
pub use handshake::{accept_response, build_websocket_scope, deny_response, is_upgrade_request};
