//! The ASGI event vocabulary (spec §6), as a discriminated union.
//!
//! Field names and types follow the ASGI 3.0 specification verbatim; this is
//! the wire contract with the application, not an implementation detail, so
//! it is deliberately un-generic and exhaustively matched everywhere it is
//! consumed.

use bytes::Bytes;

/// A single (name, value) header pair, byte-exact, order-preserving.
pub type HeaderPair = (Bytes, Bytes);

/// An event flowing from the protocol to the application (`receive` side).
#[derive(Debug, Clone)]
pub enum ReceiveEvent {
    /// `http.request` — one chunk of the request body.
    HttpRequest { body: Bytes, more_body: bool },
    /// `http.disconnect` — the transport was lost, or the cycle ended
    /// before the application finished. Delivered at most once.
    HttpDisconnect,
    /// `websocket.connect` — the handshake has been accepted for routing
    /// and awaits the application's accept/close decision.
    WebSocketConnect,
    /// `websocket.receive` — one reassembled WebSocket message.
    WebSocketReceive(WebSocketMessage),
    /// `websocket.disconnect` — peer close, server close, or transport
    /// loss. Delivered at most once.
    WebSocketDisconnect { code: u16 },
}

/// The payload of a reassembled WebSocket message: exactly one of the two
/// ASGI-defined fields is ever present on a given event.
#[derive(Debug, Clone)]
pub enum WebSocketMessage {
    Text(String),
    Bytes(Bytes),
}

/// An event flowing from the application to the protocol (`send` side).
#[derive(Debug, Clone)]
pub enum SendEvent {
    /// `http.response.start` — status and headers; must be the first event
    /// of an HTTP response cycle, and sent exactly once.
    HttpResponseStart {
        status: u16,
        headers: Vec<HeaderPair>,
        trailers: bool,
    },
    /// `http.response.body` — zero or more per response, in order.
    HttpResponseBody { body: Bytes, more_body: bool },
    /// `websocket.accept` — accepts a pending `websocket.connect`.
    WebSocketAccept {
        subprotocol: Option<String>,
        headers: Vec<HeaderPair>,
    },
    /// `websocket.send` — exactly one of `text`/`bytes` must be set.
    WebSocketSend(WebSocketMessage),
    /// `websocket.close` — accepts-then-closes, or denies a pending
    /// `websocket.connect`, depending on cycle state.
    WebSocketClose { code: u16 },
}

impl SendEvent {
    /// Name of the ASGI event `type` field, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            SendEvent::HttpResponseStart { .. } => "http.response.start",
            SendEvent::HttpResponseBody { .. } => "http.response.body",
            SendEvent::WebSocketAccept { .. } => "websocket.accept",
            SendEvent::WebSocketSend(_) => "websocket.send",
            SendEvent::WebSocketClose { .. } => "websocket.close",
        }
    }
}

impl ReceiveEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            ReceiveEvent::HttpRequest { .. } => "http.request",
            ReceiveEvent::HttpDisconnect => "http.disconnect",
            ReceiveEvent::WebSocketConnect => "websocket.connect",
            ReceiveEvent::WebSocketReceive(_) => "websocket.receive",
            ReceiveEvent::WebSocketDisconnect { .. } => "websocket.disconnect",
        }
    }
}

/// Default close code per spec §4.4 (`websocket.close` with no `code`).
pub const DEFAULT_CLOSE_CODE: u16 = 1000;
