//! Shared configuration and orchestration (spec §4.1, §4.6, §4.7).
//!
//! Grounded on `axum::serve`: one accept loop per configured listener,
//! driven by [`crate::listener::Listener`], spawning a task per accepted
//! connection that hands the stream to a tower [`Service`] via
//! `hyper::service::service_fn` and
//! `hyper_util::server::conn::auto::Builder::serve_connection_with_upgrades`
//! (the same combination `examples/serve-with-hyper` and
//! `examples/low-level-rustls` use), with a `CancellationToken`-driven
//! graceful shutdown adapted from `axum::serve`'s `WithGracefulShutdown`
//! and [`crate::connection::ConnectionManager`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tower_service::Service;

use crate::access_log::{AccessLogEvent, AccessLogSink};
use crate::app::{DynApplication, Loader};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionManager, Role};
use crate::endpoint::{Endpoint, UnixMode};
use crate::error::Error;
use crate::listener::{ConnectionLimiter, Listener};
use crate::scope::{HttpVersion, SocketAddrPair};

#[cfg(feature = "tls")]
type MaybeTls = crate::tls::TlsConfig;
#[cfg(not(feature = "tls"))]
type MaybeTls = ();

/// State shared by every listener's accept loop and every connection task.
struct Shared {
    app: Arc<dyn DynApplication>,
    config: Arc<ServerConfig>,
    manager: Arc<ConnectionManager>,
    limiter: ConnectionLimiter,
    access_log: Option<AccessLogSink>,
}

/// The server core: holds the loaded application and configuration, not
/// yet bound to any socket.
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Load the application and assemble the server. Binding happens in
    /// [`Server::serve_until`], so construction never touches the network.
    pub fn new(config: ServerConfig, loader: &dyn Loader) -> Result<Self, Error> {
        let app = loader.load()?;
        let limiter = ConnectionLimiter::new(config.max_connections);
        let config = Arc::new(config);
        Ok(Self {
            shared: Arc::new(Shared {
                app,
                config,
                manager: Arc::new(ConnectionManager::new()),
                limiter,
                access_log: None,
            }),
        })
    }

    /// Attach an access-log sink (spec §4.7) with the given channel
    /// capacity, returning the receiving half for a front-end to drain and
    /// format. Must be called before the server starts serving.
    pub fn with_access_log(mut self, capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<AccessLogEvent>) {
        let (sink, rx) = AccessLogSink::new(capacity);
        Arc::get_mut(&mut self.shared)
            .expect("Server::with_access_log must run before the server starts serving")
            .access_log = Some(sink);
        (self, rx)
    }

    /// Bind every configured listener and serve until `shutdown` resolves
    /// (spec §4.6 "Shutdown"): stop accepting, cancel every connection's
    /// token, then give the active set up to `shutdown_grace_period` to
    /// drain before the remaining tasks are aborted.
    pub async fn serve_until(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<(), Error> {
        let shared = self.shared;
        let listeners = shared.config.listeners.clone();
        let mut tasks = Vec::with_capacity(listeners.len());
        for endpoint in listeners {
            tasks.push(spawn_listener(endpoint, None, shared.clone()).await?);
        }

        shutdown.await;
        tracing::debug!("shutdown signal received, no longer accepting new connections");

        let grace_period = shared.config.shutdown_grace_period;
        let stuck = shared.manager.shutdown(grace_period).await;
        if !stuck.is_empty() {
            tracing::warn!(count = stuck.len(), "connections still active past grace period, aborting");
        }

        for task in tasks {
            task.abort();
        }

        Ok(())
    }
}

fn tcp_addr_to_pair(addr: &SocketAddr) -> Option<SocketAddrPair> {
    Some(SocketAddrPair {
        ip: addr.ip(),
        port: addr.port(),
    })
}

#[cfg(unix)]
fn unix_addr_to_pair(_addr: &tokio::net::unix::SocketAddr) -> Option<SocketAddrPair> {
    None
}

#[cfg(unix)]
fn apply_unix_mode(path: &str, mode: UnixMode) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(Error::configuration)
}

/// Reconstruct a listening socket inherited from a parent process (spec
/// §3 "an already-open listening socket"), e.g. systemd socket activation.
/// Safety: the caller is responsible for `fd` being a valid, open,
/// listening TCP socket whose ownership is being handed to this process.
#[cfg(unix)]
fn inherited_tcp_listener(fd: i32) -> Result<TcpListener, Error> {
    use std::os::unix::io::FromRawFd;
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true).map_err(Error::configuration)?;
    TcpListener::from_std(std_listener).map_err(Error::configuration)
}

#[cfg(any(feature = "http1", feature = "http2"))]
fn spawn_listener(
    endpoint: Endpoint,
    tls: Option<MaybeTls>,
    shared: Arc<Shared>,
) -> std::pin::Pin<Box<dyn Future<Output = Result<tokio::task::JoinHandle<()>, Error>> + Send>> {
    Box::pin(async move {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host, port)).await.map_err(Error::configuration)?;
                let local = listener.local_addr().map_err(Error::configuration)?;
                tracing::info!(%local, tls = tls.is_some(), "listening");
                Ok(tokio::spawn(accept_loop(listener, tcp_addr_to_pair, tls, shared)))
            }
            Endpoint::Unix { path, mode } => {
                #[cfg(unix)]
                {
                    let listener = UnixListener::bind(&path).map_err(Error::configuration)?;
                    if let Some(mode) = mode {
                        apply_unix_mode(&path, mode)?;
                    }
                    tracing::info!(path = %path, tls = tls.is_some(), "listening");
                    Ok(tokio::spawn(accept_loop(listener, unix_addr_to_pair, tls, shared)))
                }
                #[cfg(not(unix))]
                {
                    let _ = (path, mode, tls, shared);
                    Err(Error::configuration("unix listeners require a unix target"))
                }
            }
            Endpoint::InheritedFd(fd) => {
                #[cfg(unix)]
                {
                    let listener = inherited_tcp_listener(fd)?;
                    tracing::info!(fd, tls = tls.is_some(), "listening on inherited socket");
                    Ok(tokio::spawn(accept_loop(listener, tcp_addr_to_pair, tls, shared)))
                }
                #[cfg(not(unix))]
                {
                    let _ = (fd, tls, shared);
                    Err(Error::configuration("inherited file descriptors require a unix target"))
                }
            }
            #[cfg(feature = "tls")]
            Endpoint::Tls { inner, tls: inner_tls } => spawn_listener(*inner, Some(inner_tls), shared).await,
        }
    })
}

#[cfg(not(any(feature = "http1", feature = "http2")))]
async fn spawn_listener(
    endpoint: Endpoint,
    _tls: Option<MaybeTls>,
    _shared: Arc<Shared>,
) -> Result<tokio::task::JoinHandle<()>, Error> {
    let _ = endpoint;
    Err(Error::configuration("server requires the \"http1\" or \"http2\" feature"))
}

#[cfg(any(feature = "http1", feature = "http2"))]
async fn accept_loop<L>(mut listener: L, to_pair: fn(&L::Addr) -> Option<SocketAddrPair>, tls: Option<MaybeTls>, shared: Arc<Shared>)
where
    L: Listener,
{
    let shutdown = shared.manager.shutdown_token();
    loop {
        let (io, addr) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        let Some(permit) = shared.limiter.try_acquire() else {
            tracing::warn!("connection limit reached, dropping accepted transport");
            drop(io);
            continue;
        };

        let remote = to_pair(&addr);
        let local = listener.local_addr().ok().as_ref().and_then(to_pair);
        let shared = shared.clone();

        match &tls {
            #[cfg(feature = "tls")]
            Some(tls) => {
                let tls = tls.clone();
                tokio::spawn(async move {
                    if let Some(stream) = tls.handshake(io).await {
                        let negotiated = match crate::tls::negotiated_protocol(&stream) {
                            crate::tls::NegotiatedProtocol::Http2 => HttpVersion::Http2,
                            crate::tls::NegotiatedProtocol::Http1 => HttpVersion::Http1_1,
                        };
                        serve_connection(stream, true, Some(negotiated), remote, local, shared, permit).await;
                    }
                });
            }
            _ => {
                tokio::spawn(serve_connection(io, false, None, remote, local, shared, permit));
            }
        }
    }
}

/// Wraps an accepted transport so the first successfully read byte flips a
/// shared flag, letting [`serve_connection`] tell whether its connect-
/// timeout deadline (spec §4.6 step 1: bytes from peer) was met, entirely
/// independent of what hyper does with those bytes afterwards.
struct ActivityIo<IO> {
    inner: IO,
    activity: Arc<AtomicBool>,
}

impl<IO> tokio::io::AsyncRead for ActivityIo<IO>
where
    IO: tokio::io::AsyncRead + Unpin,
{
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = std::pin::Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, std::task::Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.activity.store(true, Ordering::Relaxed);
        }
        poll
    }
}

impl<IO> tokio::io::AsyncWrite for ActivityIo<IO>
where
    IO: tokio::io::AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(any(feature = "http1", feature = "http2"))]
async fn serve_connection<IO>(
    io: IO,
    tls: bool,
    negotiated: Option<HttpVersion>,
    remote: Option<SocketAddrPair>,
    local: Option<SocketAddrPair>,
    shared: Arc<Shared>,
    _permit: crate::listener::ConnectionPermit,
) where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    use crate::http::service::AsgiService;
    use hyper_util::rt::{TokioExecutor, TokioIo};

    let id = shared.manager.next_id();
    let http_version = negotiated.unwrap_or(HttpVersion::Http1_1);
    let role = match http_version {
        HttpVersion::Http2 => Role::Http2,
        HttpVersion::Http1_1 => Role::Http1,
    };
    let connection = Connection::new(id, remote, local, tls, http_version, role);
    let handle = shared.manager.register(connection.clone());

    let service = AsgiService {
        app: shared.app.clone(),
        config: shared.config.clone(),
        connection,
        tls,
        cancellation: handle.cancellation.clone(),
        access_log: shared.access_log.clone(),
        manager: shared.manager.clone(),
    };

    // The manager only tracks membership and cancellation (see
    // `ConnectionManager::register`'s doc comment); arming the
    // connect-timeout itself is this function's job.
    let activity = Arc::new(AtomicBool::new(false));
    let connect_timeout = shared.config.connect_timeout;
    let connect_watchdog = handle.cancellation.clone();
    let watched_activity = activity.clone();
    let connect_watcher = tokio::spawn(async move {
        tokio::time::sleep(connect_timeout).await;
        if !watched_activity.load(Ordering::Relaxed) {
            connect_watchdog.cancel();
        }
    });

    let io = ActivityIo { inner: io, activity };
    let io = TokioIo::new(io);
    // Hyper's `Service` takes `&self`, tower's takes `&mut self`; cloning
    // the cheap `Arc`-backed service through the closure sidesteps the
    // mismatch without a `poll_ready` call, same as `examples/serve-with-hyper`.
    let hyper_service = hyper::service::service_fn(move |request: http::Request<hyper::body::Incoming>| {
        service.clone().call(request)
    });

    #[allow(unused_mut)]
    let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    #[cfg(feature = "http1")]
    builder
        .http1()
        .timer(hyper_util::rt::TokioTimer::new())
        .header_read_timeout(shared.config.idle_timeout);
    #[cfg(feature = "http2")]
    builder.http2().enable_connect_protocol();

    let mut conn = std::pin::pin!(builder.serve_connection_with_upgrades(io, hyper_service));

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    tracing::debug!(connection = id, "connection error: {err:#}");
                }
                break;
            }
            _ = handle.cancellation.cancelled() => {
                conn.as_mut().graceful_shutdown();
            }
        }
    }

    connect_watcher.abort();
    shared.manager.deregister(id);
}

#[cfg(all(test, any(feature = "http1", feature = "http2")))]
mod tests {
    use super::*;

    use std::future::Future;
    use std::pin::Pin;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::app::{Application, DynApplication};
    use crate::bridge::{Receiver, Sender};
    use crate::error::Error;
    use crate::event::{ReceiveEvent, SendEvent};
    use crate::scope::Scope;

    /// Replies `200 text/plain` with the body "hi", matching spec §8
    /// scenario 1.
    struct Hello;

    impl Application for Hello {
        async fn call(&self, scope: Scope, mut receive: Receiver, send: Sender) -> Result<(), Error> {
            assert!(matches!(scope, Scope::Http(_)));
            assert!(matches!(receive.receive().await, ReceiveEvent::HttpRequest { more_body: false, .. }));
            send.send(SendEvent::HttpResponseStart {
                status: 200,
                headers: vec![(
                    bytes::Bytes::from_static(b"content-type"),
                    bytes::Bytes::from_static(b"text/plain"),
                )],
                trailers: false,
            })
            .await
            .unwrap();
            send.send(SendEvent::HttpResponseBody {
                body: bytes::Bytes::from_static(b"hi"),
                more_body: false,
            })
            .await
            .unwrap();
            Ok(())
        }
    }

    /// Replies to every request with its own path as the body, so pipelined
    /// responses can be matched back to the request that produced them.
    struct EchoPath;

    impl Application for EchoPath {
        async fn call(&self, scope: Scope, mut receive: Receiver, send: Sender) -> Result<(), Error> {
            let path = match &scope {
                Scope::Http(http) => http.path.clone(),
                _ => panic!("expected an http scope"),
            };
            while !matches!(receive.receive().await, ReceiveEvent::HttpRequest { more_body: false, .. }) {}
            send.send(SendEvent::HttpResponseStart {
                status: 200,
                headers: vec![],
                trailers: false,
            })
            .await
            .unwrap();
            send.send(SendEvent::HttpResponseBody {
                body: bytes::Bytes::from(path),
                more_body: false,
            })
            .await
            .unwrap();
            Ok(())
        }
    }

    fn shared_for(app: impl DynApplication) -> Arc<Shared> {
        Arc::new(Shared {
            app: Arc::new(app),
            config: Arc::new(ServerConfig::default()),
            manager: Arc::new(ConnectionManager::new()),
            limiter: ConnectionLimiter::new(None),
            access_log: None,
        })
    }

    fn serve_duplex(
        shared: Arc<Shared>,
        server: tokio::io::DuplexStream,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let permit = shared.limiter.try_acquire().unwrap();
        Box::pin(serve_connection(server, false, None, None, None, shared, permit))
    }

    #[tokio::test]
    async fn full_response_matches_wire_format() {
        let shared = shared_for(Hello);
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_duplex(shared, server));

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("content-type: text/plain\r\n"), "{response}");
        assert!(response.contains("server: daphne\r\n"), "{response}");
        assert!(response.ends_with("2\r\nhi\r\n0\r\n\r\n"), "{response}");

        task.abort();
    }

    #[tokio::test]
    async fn pipelined_requests_reply_in_order() {
        let shared = shared_for(EchoPath);
        let (mut client, server) = tokio::io::duplex(8192);
        let task = tokio::spawn(serve_duplex(shared, server));

        client
            .write_all(
                b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();

        let first_at = response.find("/first").expect("first response body present");
        let second_at = response.find("/second").expect("second response body present");
        assert!(first_at < second_at, "responses arrived out of order: {response}");

        task.abort();
    }

    #[tokio::test]
    async fn connect_timeout_tears_down_a_connection_with_no_bytes() {
        let mut config = ServerConfig::default();
        config.connect_timeout = std::time::Duration::from_millis(20);
        let shared = Arc::new(Shared {
            app: Arc::new(Hello),
            config: Arc::new(config),
            manager: Arc::new(ConnectionManager::new()),
            limiter: ConnectionLimiter::new(None),
            access_log: None,
        });
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_duplex(shared, server));

        tokio::time::timeout(std::time::Duration::from_millis(500), task)
            .await
            .expect("connect-timeout should have ended the connection task")
            .unwrap();

        drop(client);
    }
}
