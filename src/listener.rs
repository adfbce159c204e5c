//! The listener set (spec §4.1): accept transports and hand them to a
//! protocol factory.
//!
//! Grounded on axum's `serve::Listener` trait (`fn accept` returning an I/O
//! type + peer address, with accept-errors retried rather than propagated)
//! and its `ListenerExt::handshake` combinator, which is exactly the shape
//! needed to layer TLS over a plain listener (see [`crate::tls`]).

use std::{future::Future, io, sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// Types that can listen for connections, mirroring axum's `Listener`.
pub trait Listener: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Addr: Send;

    /// Accept a new incoming connection. Transient accept errors (the
    /// `ConnectionAborted`/`ConnectionReset`/`ConnectionRefused` family) are
    /// swallowed and retried internally, same as hyper and axum do.
    fn accept(&mut self) -> impl Future<Output = (Self::Io, Self::Addr)> + Send;

    fn local_addr(&self) -> io::Result<Self::Addr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;
    type Addr = std::net::SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match Self::accept(self).await {
                Ok(pair) => return pair,
                Err(e) => handle_accept_error(e).await,
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Self::local_addr(self)
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    type Io = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match Self::accept(self).await {
                Ok(pair) => return pair,
                Err(e) => handle_accept_error(e).await,
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Self::local_addr(self)
    }
}

async fn handle_accept_error(e: io::Error) {
    if is_connection_error(&e) {
        return;
    }
    tracing::error!("accept error: {e}");
    tokio::time::sleep(Duration::from_secs(1)).await;
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

/// Enforces spec §4.1's global concurrency cap: once the permit pool is
/// exhausted, newly accepted transports are closed immediately rather than
/// handed to a protocol factory — the listener-level equivalent of a 503,
/// since no protocol has been negotiated yet to write a real response.
#[derive(Clone)]
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
}

/// An accept-permit; dropping it returns the slot to the pool. Held for the
/// lifetime of a connection (transport + application task).
pub struct ConnectionPermit(tokio::sync::OwnedSemaphorePermit);

impl ConnectionLimiter {
    pub fn new(max_connections: Option<usize>) -> Self {
        let capacity = max_connections.unwrap_or(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Try to reserve a connection slot without waiting. `None` means the
    /// cap is currently saturated and the transport should be dropped.
    pub fn try_acquire(&self) -> Option<ConnectionPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(ConnectionPermit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_rejects_past_capacity() {
        let limiter = ConnectionLimiter::new(Some(1));
        let first = limiter.try_acquire();
        assert!(first.is_some());
        let second = limiter.try_acquire();
        assert!(second.is_none());
        drop(first);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn unbounded_limiter_never_rejects() {
        let limiter = ConnectionLimiter::new(None);
        let permits: Vec<_> = (0..64).map(|_| limiter.try_acquire()).collect();
        assert!(permits.iter().all(Option::is_some));
    }
}
