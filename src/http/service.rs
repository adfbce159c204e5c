//! The per-connection `Service` that dispatches each request either into
//! an HTTP request cycle or a WebSocket handshake (spec §4.3 "Upgrade
//! detection").
//!
//! `AsgiService` is cloned per-request into a `hyper::service::service_fn`
//! closure (hyper's `Service` takes `&self`, tower's takes `&mut self`, so
//! a clone of the cheap `Arc`-backed service sidesteps the mismatch without
//! a `poll_ready` call) and driven by
//! `hyper_util::server::conn::auto::Builder::serve_connection_with_upgrades`.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use tokio_util::sync::CancellationToken;
use tower_service::Service;

use crate::access_log::{AccessLogEvent, AccessLogSink};
use crate::app::DynApplication;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionManager};
use crate::error::Error;

use super::cycle::{build_http_scope, drive_http_cycle, ResponseBody};

/// One connection's ASGI-facing `Service`. Cloned per-request (see module
/// docs); the clone is cheap, everything behind it is an `Arc` or a
/// `Copy`/`Clone` value type.
#[derive(Clone)]
pub struct AsgiService {
    pub app: Arc<dyn DynApplication>,
    pub config: Arc<ServerConfig>,
    pub connection: Connection,
    pub tls: bool,
    pub cancellation: CancellationToken,
    pub access_log: Option<AccessLogSink>,
    pub manager: Arc<ConnectionManager>,
}

impl Service<Request<Incoming>> for AsgiService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let app = self.app.clone();
        let config = self.config.clone();
        let connection = self.connection.clone();
        let tls = self.tls;
        let cancellation = self.cancellation.clone();
        let access_log = self.access_log.clone();
        let manager = self.manager.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();

            if is_upgrade_request(&parts) {
                return Ok(handle_upgrade(app, parts, &connection, config, cancellation, tls, manager).await);
            }

            let method = parts.method.to_string();
            let path = parts.uri.path().to_string();
            let client = connection.remote.as_ref().map(|pair| pair.ip);
            let started = Instant::now();

            let scope = match build_http_scope(&parts, &connection, &config, tls) {
                Ok(scope) => scope,
                Err(_) => return Ok(bad_request_response(&config)),
            };

            let response = drive_http_cycle(app, scope, body, config, cancellation).await;

            if let Some(sink) = &access_log {
                sink.emit(AccessLogEvent {
                    method,
                    path,
                    status: response.status().as_u16(),
                    duration: started.elapsed(),
                    client,
                });
            }

            Ok(response)
        })
    }
}

#[cfg(feature = "ws")]
fn is_upgrade_request(parts: &http::request::Parts) -> bool {
    crate::websocket::is_upgrade_request(parts)
}

#[cfg(not(feature = "ws"))]
fn is_upgrade_request(_parts: &http::request::Parts) -> bool {
    false
}

#[cfg(feature = "ws")]
async fn handle_upgrade(
    app: Arc<dyn DynApplication>,
    mut parts: http::request::Parts,
    connection: &Connection,
    config: Arc<ServerConfig>,
    cancellation: CancellationToken,
    tls: bool,
    manager: Arc<ConnectionManager>,
) -> Response<ResponseBody> {
    let sec_websocket_key = parts.headers.get(http::header::SEC_WEBSOCKET_KEY).cloned();
    let on_upgrade = parts.extensions.remove::<hyper::upgrade::OnUpgrade>();

    match (sec_websocket_key, on_upgrade) {
        (Some(key), Some(on_upgrade)) => {
            crate::websocket::cycle::negotiate_handshake(
                app,
                &parts,
                key,
                on_upgrade,
                connection,
                config,
                cancellation,
                tls,
                manager,
            )
            .await
        }
        _ => bad_request_response(&config),
    }
}

#[cfg(not(feature = "ws"))]
async fn handle_upgrade(
    _app: Arc<dyn DynApplication>,
    _parts: http::request::Parts,
    _connection: &Connection,
    config: Arc<ServerConfig>,
    _cancellation: CancellationToken,
    _tls: bool,
    _manager: Arc<ConnectionManager>,
) -> Response<ResponseBody> {
    bad_request_response(&config)
}

fn bad_request_response(config: &ServerConfig) -> Response<ResponseBody> {
    plain_error_response(StatusCode::BAD_REQUEST, config)
}

fn plain_error_response(status: StatusCode, config: &ServerConfig) -> Response<ResponseBody> {
    use bytes::Bytes;
    use futures_util::stream;
    use http_body::Frame;
    use http_body_util::{BodyExt, StreamBody};

    let mut builder = Response::builder().status(status);
    if config.emits_server_header() {
        builder = builder.header("server", config.server_name.as_str());
    }
    let body: Pin<Box<dyn futures_util::Stream<Item = Result<Frame<Bytes>, Error>> + Send>> =
        Box::pin(stream::empty());
    let body = StreamBody::new(body).boxed_unsync();
    builder
        .body(body)
        .unwrap_or_else(|_| Response::new(StreamBody::new(Box::pin(stream::empty())).boxed_unsync()))
}
