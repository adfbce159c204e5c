//! RFC 6455 handshake: scope construction and the 101/403 responses (spec
//! §4.4 step 1-2).

use std::pin::Pin;

use base64::engine::{general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use http::{request::Parts, HeaderName, HeaderValue, Response, StatusCode};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use sha1::{Digest, Sha1};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::Error;
use crate::headers::{apply_proxy_headers, extract_root_path_header, strip_root_path, to_scope_headers};
use crate::http::cycle::ResponseBody;
use crate::scope::{HttpVersion, Scheme, SocketAddrPair, WebSocketScope};

/// The RFC 6455 accept-key magic GUID.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Whether a request's headers ask for a WebSocket upgrade (spec §4.3
/// "Upgrade detection"): `Upgrade: websocket` and `Connection: upgrade`,
/// case-insensitively, `Connection` matched as a substring since it may be
/// a comma list (`keep-alive, Upgrade`).
pub fn is_upgrade_request(parts: &Parts) -> bool {
    let upgrade = parts
        .headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = parts
        .headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade && connection
}

/// Build the `websocket` scope for an upgrade request (spec §4.4 step 1):
/// same keys as the `http` scope minus `method`, plus `subprotocols`.
pub fn build_websocket_scope(
    parts: &Parts,
    connection: &Connection,
    config: &ServerConfig,
    tls: bool,
) -> Result<WebSocketScope, Error> {
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

    let subprotocols = parts
        .headers
        .get(http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let http_version = match parts.version {
        http::Version::HTTP_2 => HttpVersion::Http2,
        _ => HttpVersion::Http1_1,
    };

    Ok(WebSocketScope {
        http_version,
        scheme,
        path,
        raw_path: raw_path_bytes,
        query_string,
        root_path,
        headers,
        client,
        server: connection.local.clone(),
        subprotocols,
    })
}

/// Compute `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`
/// (RFC 6455 §1.3): SHA-1 over the key concatenated with the RFC's magic
/// GUID, base64-encoded.
pub fn compute_accept_key(sec_websocket_key: &[u8]) -> HeaderValue {
    let mut sha1 = Sha1::default();
    sha1.update(sec_websocket_key);
    sha1.update(WEBSOCKET_GUID.as_bytes());
    let encoded = STANDARD.encode(sha1.finalize());
    HeaderValue::from_str(&encoded).expect("base64 output is a valid header value")
}

fn empty_body() -> ResponseBody {
    let body: Pin<Box<dyn Stream<Item = Result<Frame<Bytes>, Error>> + Send>> = Box::pin(stream::empty());
    StreamBody::new(body).boxed_unsync()
}

/// Build the 101 Switching Protocols response that accepts the handshake
/// (spec §4.4 step 2).
pub fn accept_response(
    sec_websocket_key: &HeaderValue,
    subprotocol: Option<&str>,
    extra_headers: &[(Bytes, Bytes)],
    config: &ServerConfig,
) -> Result<Response<ResponseBody>, Error> {
    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::CONNECTION, HeaderValue::from_static("upgrade"))
        .header(http::header::UPGRADE, HeaderValue::from_static("websocket"))
        .header(
            http::header::SEC_WEBSOCKET_ACCEPT,
            compute_accept_key(sec_websocket_key.as_bytes()),
        );

    if let Some(protocol) = subprotocol {
        builder = builder.header(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(protocol).map_err(Error::protocol_violation)?,
        );
    }

    if config.emits_server_header() {
        builder = builder.header("server", config.server_name.as_str());
    }

    {
        let headers = builder.headers_mut().expect("builder has no error yet");
        for (name, value) in extra_headers {
            let name = HeaderName::from_bytes(name).map_err(Error::protocol_violation)?;
            let value = HeaderValue::from_bytes(value).map_err(Error::protocol_violation)?;
            headers.append(name, value);
        }
    }

    builder.body(empty_body()).map_err(Error::protocol_violation)
}

/// Build the response that denies a pending handshake (spec §4.4 step 2:
/// "emit HTTP 403 response and transition to `denied`"), or the 403 used
/// when the handshake-timeout is exceeded.
pub fn deny_response(config: &ServerConfig) -> Response<ResponseBody> {
    let mut builder = Response::builder().status(StatusCode::FORBIDDEN);
    if config.emits_server_header() {
        builder = builder.header("server", config.server_name.as_str());
    }
    builder
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        let key = HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ==");
        let accept = compute_accept_key(key.as_bytes());
        assert_eq!(accept.to_str().unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn accept_response_sets_switching_protocols_and_computed_accept_key() {
        let key = HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ==");
        let config = ServerConfig::default();
        let response = accept_response(&key, None, &[], &config).unwrap();

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers().get(http::header::SEC_WEBSOCKET_ACCEPT).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(response.headers().get(http::header::UPGRADE).unwrap(), "websocket");
        assert!(response.headers().get(http::header::SEC_WEBSOCKET_PROTOCOL).is_none());
    }

    #[test]
    fn upgrade_detection_requires_both_headers() {
        let (parts, ()) = http::Request::builder()
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .body(())
            .unwrap()
            .into_parts();
        assert!(is_upgrade_request(&parts));

        let (parts, ()) = http::Request::builder()
            .header("upgrade", "websocket")
            .body(())
            .unwrap()
            .into_parts();
        assert!(!is_upgrade_request(&parts));
    }
}
