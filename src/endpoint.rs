//! Endpoint descriptors (spec §3, §4.1): a declarative description of what
//! to listen on, created at startup and destroyed on teardown.

use std::net::IpAddr;

#[cfg(feature = "tls")]
use crate::tls::TlsConfig;

/// Unix socket file permission mode, `chmod`-style, e.g. `0o660`.
pub type UnixMode = u32;

/// A single endpoint to bind and accept connections on.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: IpAddr, port: u16 },
    Unix { path: String, mode: Option<UnixMode> },
    /// An already-open listening socket, inherited from a parent process
    /// (e.g. systemd socket activation), identified by file descriptor.
    InheritedFd(i32),
    /// Any of the above, wrapped with TLS: ALPN negotiates HTTP/1.1 vs
    /// HTTP/2 (spec §4.1).
    #[cfg(feature = "tls")]
    Tls {
        inner: Box<Endpoint>,
        tls: TlsConfig,
    },
}

impl Endpoint {
    pub fn tcp(host: IpAddr, port: u16) -> Self {
        Endpoint::Tcp { host, port }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Endpoint::Unix {
            path: path.into(),
            mode: None,
        }
    }

    /// Whether connections accepted on this endpoint are TLS-terminated.
    pub fn is_tls(&self) -> bool {
        match self {
            #[cfg(feature = "tls")]
            Endpoint::Tls { .. } => true,
            _ => false,
        }
    }

    /// A short label for logging, not a stable wire format.
    pub fn describe(&self) -> String {
        match self {
            Endpoint::Tcp { host, port } => format!("tcp:{host}:{port}"),
            Endpoint::Unix { path, .. } => format!("unix:{path}"),
            Endpoint::InheritedFd(fd) => format!("fd:{fd}"),
            #[cfg(feature = "tls")]
            Endpoint::Tls { inner, .. } => format!("tls+{}", inner.describe()),
        }
    }
}
