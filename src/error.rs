//! The crate's error type.
//!
//! Grounded on `axum_core::Error`: a thin boxed-error wrapper, rather than a
//! generated-per-variant `thiserror` enum. [`ErrorKind`] carries the
//! classification spec §7 needs to pick a peer-visible response without
//! downcasting the boxed cause.

use std::{error::Error as StdError, fmt};

/// A boxed, type-erased error, same shape as `axum_core::BoxError`.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The categories of failure spec §7 distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad request line, bad headers, oversized frame, invalid UTF-8 where
    /// required. Peer-visible as HTTP 400 or WebSocket close 1002/1009.
    MalformedRequest,
    /// Out-of-order ASGI events, wrong value types, invalid status code,
    /// a second `response.start`. Peer-visible as HTTP 500 (if nothing has
    /// been written yet) or WebSocket close 1011.
    ProtocolViolation,
    /// The application callable raised. Same peer treatment as
    /// [`ErrorKind::ProtocolViolation`].
    ApplicationError,
    /// A configured deadline elapsed.
    Timeout(TimeoutKind),
    /// The transport went away mid-cycle. Never surfaced to the peer; the
    /// application receives a `*.disconnect` event instead.
    TransportLost,
    /// Bad listener/TLS/application configuration at startup.
    Configuration,
}

/// Which deadline fired, for [`ErrorKind::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TimeoutKind {
    Connect,
    HttpResponseStart,
    WebSocketHandshake,
    Idle,
    PingTimeout,
    ApplicationClose,
}

/// Errors that can happen anywhere in this crate.
pub struct Error {
    kind: ErrorKind,
    inner: BoxError,
}

impl Error {
    pub fn new(kind: ErrorKind, error: impl Into<BoxError>) -> Self {
        Self {
            kind,
            inner: error.into(),
        }
    }

    pub fn malformed(error: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::MalformedRequest, error)
    }

    pub fn protocol_violation(error: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, error)
    }

    pub fn application(error: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::ApplicationError, error)
    }

    pub fn timeout(kind: TimeoutKind) -> Self {
        Self::new(ErrorKind::Timeout(kind), format!("{kind:?} timed out"))
    }

    pub fn transport_lost(error: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::TransportLost, error)
    }

    pub fn configuration(error: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::Configuration, error)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("source", &self.inner)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.inner)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.inner)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::transport_lost(err)
    }
}
