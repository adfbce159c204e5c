//! The HTTP request cycle (spec §3 "Request cycle", §4.2).

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use http::{request::Parts, HeaderName, HeaderValue, Response, StatusCode};
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use tokio_util::sync::CancellationToken;

use crate::app::DynApplication;
use crate::bridge::{new_bridge, ReceiveFeed, SendSink};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::Error;
use crate::event::{HeaderPair, ReceiveEvent, SendEvent};
use crate::headers::{apply_proxy_headers, extract_root_path_header, strip_root_path, to_scope_headers};
use crate::scope::{HttpScope, HttpVersion, Scheme, Scope, SocketAddrPair};

/// A streamed response body driven by the application's
/// `http.response.body` events, boxed so the HTTP and WebSocket-handshake
/// response paths ([`crate::websocket::handshake`]) can share one `Service`
/// response type.
pub type ResponseBody = UnsyncBoxBody<Bytes, Error>;

/// Build the `http` scope for an incoming request (spec §4.2). Takes the
/// request's [`Parts`] rather than the full `Request<Incoming>` so scope
/// construction doesn't depend on hyper's body type at all.
pub fn build_http_scope(
    parts: &Parts,
    connection: &Connection,
    config: &ServerConfig,
    tls: bool,
) -> Result<HttpScope, Error> {
    let mut headers = to_scope_headers(
        parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().as_bytes(), value.as_bytes())),
    );

    let header_root_path = extract_root_path_header(&mut headers);
    let root_path = header_root_path.unwrap_or_else(|| config.root_path.clone());

    let raw_path_bytes = Bytes::copy_from_slice(parts.uri.path().as_bytes());
    if !raw_path_bytes.is_ascii() {
        return Err(Error::malformed("non-ASCII bytes in request target"));
    }
    let decoded_path = percent_encoding::percent_decode(&raw_path_bytes)
        .decode_utf8()
        .map_err(Error::malformed)?
        .into_owned();
    let path = strip_root_path(&decoded_path, &root_path).to_string();

    let query_string = Bytes::copy_from_slice(parts.uri.query().unwrap_or("").as_bytes());

    let mut scheme = if tls { Scheme::Https } else { Scheme::Http };

    let rewrite = apply_proxy_headers(&headers, &config.proxy_headers);
    if let Some(forwarded_scheme) = &rewrite.scheme {
        scheme = match forwarded_scheme.as_str() {
            "https" => Scheme::Https,
            "http" => Scheme::Http,
            _ => scheme,
        };
    }

    let client = match (rewrite.client_ip, connection.remote.clone()) {
        (Some(ip), Some(orig)) => Some(SocketAddrPair {
            ip,
            port: rewrite.client_port.unwrap_or(orig.port),
        }),
        (Some(ip), None) => Some(SocketAddrPair {
            ip,
            port: rewrite.client_port.unwrap_or(0),
        }),
        (None, orig) => orig,
    };

    let http_version = match parts.version {
        http::Version::HTTP_2 => HttpVersion::Http2,
        _ => HttpVersion::Http1_1,
    };

    Ok(HttpScope {
        http_version,
        method: parts.method.as_str().to_ascii_uppercase(),
        scheme,
        path,
        raw_path: raw_path_bytes,
        query_string,
        root_path,
        headers,
        client,
        server: connection.local.clone(),
    })
}

/// Feed one ASGI `http.request` event per incoming body frame, followed by
/// a final `more_body=false` event. A read error tears down the feed
/// without sending a final chunk; the bridge synthesizes `http.disconnect`
/// once the application asks for the next event (spec §4.2).
pub async fn pump_request_body(mut body: Incoming, feed: ReceiveFeed) {
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    if feed
                        .feed(ReceiveEvent::HttpRequest {
                            body: data,
                            more_body: true,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::debug!("request body read error: {e}");
                return;
            }
            None => {
                let _ = feed
                    .feed(ReceiveEvent::HttpRequest {
                        body: Bytes::new(),
                        more_body: false,
                    })
                    .await;
                return;
            }
        }
    }
}

/// Watches a spawned application task after the response has been handed
/// off to hyper: an app stuck in `receive()` past a connection's
/// cancellation (spec §5's "forcibly dropped" requirement) would otherwise
/// park on `bridge`'s disconnect-exhausted `std::future::pending` forever,
/// leaking the task. Normal completion needs no supervision; only
/// cancellation starts the close-timeout clock.
async fn supervise_application_task(
    app_task: tokio::task::JoinHandle<()>,
    cancellation: CancellationToken,
    close_timeout: Duration,
) {
    let abort_handle = app_task.abort_handle();
    tokio::pin!(app_task);
    tokio::select! {
        _ = &mut app_task => {}
        _ = cancellation.cancelled() => {
            if tokio::time::timeout(close_timeout, &mut app_task).await.is_err() {
                abort_handle.abort();
                tracing::debug!("application task outlived close-timeout, aborting");
            }
        }
    }
}

/// Drive one HTTP request cycle: runs the application concurrently with
/// feeding the request body, and returns a `Response` as soon as
/// `http.response.start` has arrived (spec §4.2 response state machine).
pub async fn drive_http_cycle(
    app: Arc<dyn DynApplication>,
    scope: HttpScope,
    incoming: Incoming,
    config: Arc<ServerConfig>,
    cancellation: CancellationToken,
) -> Response<ResponseBody> {
    let (receiver, feed, sender, mut sink) = new_bridge(ReceiveEvent::HttpDisconnect);

    tokio::spawn(pump_request_body(incoming, feed));

    let app_task = tokio::spawn(async move {
        if let Err(e) = app.call(Scope::Http(scope), receiver, sender).await {
            tracing::error!(kind = ?e.kind(), "application task failed: {e}");
        }
    });
    tokio::spawn(supervise_application_task(
        app_task,
        cancellation.clone(),
        config.application_close_timeout,
    ));

    let start_deadline = config.http_response_start_timeout;
    let first_event = match start_deadline {
        Some(timeout) => tokio::select! {
            biased;
            _ = cancellation.cancelled() => None,
            _ = tokio::time::sleep(timeout) => {
                return error_response(StatusCode::SERVICE_UNAVAILABLE, &config, true);
            }
            event = sink.next() => event,
        },
        None => tokio::select! {
            biased;
            _ = cancellation.cancelled() => None,
            event = sink.next() => event,
        },
    };

    match first_event {
        Some(SendEvent::HttpResponseStart {
            status,
            headers,
            trailers: _,
        }) => match build_response(status, headers, &config, sink) {
            Ok(response) => response,
            Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &config, false),
        },
        Some(_) => {
            tracing::error!("application sent an out-of-order event before http.response.start");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &config, false)
        }
        None => error_response(StatusCode::INTERNAL_SERVER_ERROR, &config, false),
    }
}

fn build_response(
    status: u16,
    headers: Vec<HeaderPair>,
    config: &ServerConfig,
    sink: SendSink,
) -> Result<Response<ResponseBody>, Error> {
    if !(100..=599).contains(&status) {
        return Err(Error::protocol_violation(format!("invalid status {status}")));
    }
    let status = StatusCode::from_u16(status).map_err(Error::protocol_violation)?;

    let mut builder = Response::builder().status(status);
    {
        let response_headers = builder.headers_mut().expect("builder has no error yet");
        for (name, value) in &headers {
            let name = HeaderName::from_bytes(name).map_err(Error::protocol_violation)?;
            let value = HeaderValue::from_bytes(value).map_err(Error::protocol_violation)?;
            response_headers.append(name, value);
        }
        if config.emits_server_header() {
            response_headers.append(
                HeaderName::from_static("server"),
                HeaderValue::from_str(&config.server_name).map_err(Error::protocol_violation)?,
            );
        }
    }

    let body_stream = response_body_stream(sink);
    builder
        .body(StreamBody::new(body_stream).boxed_unsync())
        .map_err(Error::protocol_violation)
}

fn response_body_stream(
    sink: SendSink,
) -> Pin<Box<dyn Stream<Item = Result<Frame<Bytes>, Error>> + Send>> {
    Box::pin(stream::unfold(
        (sink, false),
        |(mut sink, done)| async move {
            if done {
                return None;
            }
            match sink.next().await {
                Some(SendEvent::HttpResponseBody { body, more_body }) => {
                    Some((Ok(Frame::data(body)), (sink, !more_body)))
                }
                Some(_) => Some((
                    Err(Error::protocol_violation(
                        "expected http.response.body after http.response.start",
                    )),
                    (sink, true),
                )),
                None => None,
            }
        },
    ))
}

/// A minimal, headers-only error response for the cases spec §7 says must
/// fall back to a generic body: protocol violations, application
/// exceptions, and pre-response timeouts.
fn error_response(status: StatusCode, config: &ServerConfig, retry: bool) -> Response<ResponseBody> {
    let mut builder = Response::builder().status(status);
    if config.emits_server_header() {
        builder = builder.header("server", config.server_name.as_str());
    }
    if retry {
        builder = builder.header("retry-after", "1");
    }
    let body: Pin<Box<dyn Stream<Item = Result<Frame<Bytes>, Error>> + Send>> = Box::pin(stream::empty());
    let body = StreamBody::new(body).boxed_unsync();
    builder
        .body(body)
        .unwrap_or_else(|_| Response::new(StreamBody::new(Box::pin(stream::empty())).boxed_unsync()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Role};
    use std::net::IpAddr;

    fn base_connection() -> Connection {
        Connection::new(
            1,
            Some(SocketAddrPair {
                ip: "198.51.100.1".parse().unwrap(),
                port: 5555,
            }),
            Some(SocketAddrPair {
                ip: "127.0.0.1".parse().unwrap(),
                port: 8000,
            }),
            false,
            HttpVersion::Http1_1,
            Role::Http1,
        )
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = http::Request::builder().method("GET").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn scope_strips_root_path_header_and_decodes_path() {
        let req = request(
            "/forum/app?x=1",
            &[("Daphne-Root-Path", "%2Fforum"), ("Host", "example.com")],
        );
        let connection = base_connection();
        let config = ServerConfig::default();
        let scope = build_http_scope(&req, &connection, &config, false).unwrap();

        assert_eq!(scope.root_path, "/forum");
        assert_eq!(scope.path, "/app");
        assert_eq!(scope.query_string.as_ref(), b"x=1");
        assert!(scope
            .headers
            .iter()
            .all(|(name, _)| name.as_ref() != b"daphne-root-path"));
    }

    #[test]
    fn scope_applies_proxy_headers_when_enabled() {
        let req = request(
            "/",
            &[("X-Forwarded-For", "203.0.113.7, 10.0.0.1"), ("X-Forwarded-Proto", "https")],
        );
        let connection = base_connection();
        let mut config = ServerConfig::default();
        config.proxy_headers.enabled = true;
        let scope = build_http_scope(&req, &connection, &config, false).unwrap();

        assert_eq!(scope.scheme, Scheme::Https);
        assert_eq!(
            scope.client.as_ref().unwrap().ip,
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn response_builder_appends_server_header() {
        let config = ServerConfig::default();
        let (_, _, _, sink) = new_bridge(ReceiveEvent::HttpDisconnect);
        let response = build_response(
            200,
            vec![(Bytes::from_static(b"content-type"), Bytes::from_static(b"text/plain"))],
            &config,
            sink,
        )
        .unwrap();
        let server = response.headers().get("server").unwrap();
        assert_eq!(server.as_bytes(), b"daphne");
    }

    #[tokio::test]
    async fn response_body_stream_yields_chunks_in_order() {
        let (_, _, sender, sink) = new_bridge(ReceiveEvent::HttpDisconnect);
        let feeder = tokio::spawn(async move {
            sender
                .send(SendEvent::HttpResponseBody {
                    body: Bytes::from_static(b"hi"),
                    more_body: false,
                })
                .await
                .unwrap();
        });
        let mut stream = response_body_stream(sink);
        use futures_util::StreamExt;
        let frame = stream.next().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap().as_ref(), b"hi");
        assert!(stream.next().await.is_none());
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn supervised_task_is_aborted_after_close_timeout() {
        let app_task = tokio::spawn(std::future::pending::<()>());
        let handle = app_task.abort_handle();
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        supervise_application_task(app_task, cancellation, Duration::from_millis(10)).await;

        assert!(handle.is_finished());
    }

    #[test]
    fn rejects_invalid_status_code() {
        let config = ServerConfig::default();
        let (_, _, _, sink) = new_bridge(ReceiveEvent::HttpDisconnect);
        assert!(build_response(999, vec![], &config, sink).is_err());
    }
}
