//! HTTP/1.1 and HTTP/2 request cycles (spec §4.2, §4.3).
//!
//! Wire-level framing (request-line/header parsing, chunked encoding,
//! HPACK, stream multiplexing) is delegated to `hyper`/`hyper-util`: `axum`
//! never hand-rolls RFC 9110/9113 parsing either, it drives
//! `hyper_util::server::conn::auto::Builder` and focuses its own code on
//! the adapter between hyper's `Request`/`Response` and its own dispatch.
//! This crate's adapter target is the ASGI scope/event contract instead of
//! a `Router`.

pub mod cycle;
pub mod service;

pub use cycle::{build_http_scope, drive_http_cycle, ResponseBody};
pub use service::AsgiService;
