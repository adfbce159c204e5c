//! Header normalization and proxy-header rewriting (spec §4.2, §4.5).

use bytes::Bytes;
use std::net::IpAddr;

use crate::event::HeaderPair;

/// Lowercase an ASCII header name into the byte form the scope exposes.
///
/// Header names received on the wire are arbitrary-case ASCII tokens; the
/// scope always carries the lowercased form, values are left verbatim.
pub fn lowercase_name(name: &[u8]) -> Bytes {
    Bytes::from(name.to_ascii_lowercase())
}

/// Build a scope header list from wire header pairs, preserving order,
/// lowercasing names, leaving values untouched.
pub fn to_scope_headers<'a>(pairs: impl IntoIterator<Item = (&'a [u8], &'a [u8])>) -> Vec<HeaderPair> {
    pairs
        .into_iter()
        .map(|(name, value)| (lowercase_name(name), Bytes::copy_from_slice(value)))
        .collect()
}

/// Find the last value of a header (case-insensitive name match), matching
/// how most reverse proxies append rather than replace forwarding headers.
pub fn find_header<'a>(headers: &'a [HeaderPair], name: &str) -> Option<&'a Bytes> {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
        .map(|(_, v)| v)
        .last()
}

/// `Daphne-Root-Path` is a server-reserved header: consumed and never
/// forwarded to the application (spec §4.2, §8 invariant).
pub const ROOT_PATH_HEADER: &str = "daphne-root-path";

/// Strip the reserved root-path header out of a scope header list in
/// place, returning its (percent-decoded) value if present.
pub fn extract_root_path_header(headers: &mut Vec<HeaderPair>) -> Option<String> {
    let idx = headers
        .iter()
        .position(|(n, _)| n.eq_ignore_ascii_case(ROOT_PATH_HEADER.as_bytes()))?;
    let (_, value) = headers.remove(idx);
    let decoded = percent_encoding::percent_decode(&value)
        .decode_utf8_lossy()
        .into_owned();
    Some(decoded)
}

/// Strip `prefix` from the front of `path` if present, per spec §8 scenario
/// 6 (`root_path="/forum"`, `path="/app"` for a request to `/forum/app`).
pub fn strip_root_path<'a>(path: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return path;
    }
    path.strip_prefix(prefix).unwrap_or(path)
}

/// Which end of a comma-separated forwarding header to trust, configurable
/// per spec §4.5 and §9's open question about proxy-header trust policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardedTrust {
    /// Trust the furthest-downstream (rightmost) entry: the hop closest to
    /// this server, i.e. the proxy we are directly behind. This is the
    /// default, matching "the proxy immediately in front of us added the
    /// last entry".
    #[default]
    Rightmost,
    /// Trust the leftmost entry: the first hop the original client passed
    /// through. Only safe when every intermediate hop is itself trusted.
    Leftmost,
}

/// Settings controlling proxy-header rewriting of `client`/`scheme`.
#[derive(Debug, Clone)]
pub struct ProxyHeaderConfig {
    pub enabled: bool,
    pub trust: ForwardedTrust,
    /// Header carrying the original client address, default `X-Forwarded-For`.
    pub host_header: String,
    /// Header carrying the original client port, if configured.
    pub port_header: Option<String>,
}

impl Default for ProxyHeaderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trust: ForwardedTrust::default(),
            host_header: "X-Forwarded-For".to_string(),
            port_header: None,
        }
    }
}

/// Outcome of applying proxy-header rewriting to a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRewrite {
    pub client_ip: Option<IpAddr>,
    pub client_port: Option<u16>,
    pub scheme: Option<String>,
}

/// Apply proxy-header rewriting per spec §4.5.
///
/// IPv6 literals in brackets (`[::1]`) are accepted. A malformed entry is
/// ignored rather than treated as a fatal error: proxy headers are
/// advisory, never required for the connection to function.
pub fn apply_proxy_headers(headers: &[HeaderPair], config: &ProxyHeaderConfig) -> ProxyRewrite {
    let mut out = ProxyRewrite {
        client_ip: None,
        client_port: None,
        scheme: None,
    };
    if !config.enabled {
        return out;
    }

    if let Some(value) = find_header(headers, &config.host_header) {
        if let Ok(text) = std::str::from_utf8(value) {
            let candidates: Vec<&str> = text.split(',').map(str::trim).collect();
            let chosen = match config.trust {
                ForwardedTrust::Rightmost => candidates.last(),
                ForwardedTrust::Leftmost => candidates.first(),
            };
            if let Some(candidate) = chosen {
                let (ip, port) = split_host_port(candidate);
                out.client_ip = ip;
                out.client_port = port;
            }
        }
    }

    if let Some(port_header) = &config.port_header {
        if let Some(value) = find_header(headers, port_header) {
            if let Ok(text) = std::str::from_utf8(value) {
                if let Ok(port) = text.trim().parse::<u16>() {
                    out.client_port = Some(port);
                }
            }
        }
    }

    if let Some(value) = find_header(headers, "X-Forwarded-Proto") {
        if let Ok(text) = std::str::from_utf8(value) {
            out.scheme = Some(text.trim().to_ascii_lowercase());
        }
    }

    out
}

/// Split `host[:port]` or `[ipv6]:port` into an address and optional port.
fn split_host_port(value: &str) -> (Option<IpAddr>, Option<u16>) {
    if let Some(rest) = value.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let addr = rest[..end].parse::<IpAddr>().ok();
            let tail = &rest[end + 1..];
            let port = tail.strip_prefix(':').and_then(|p| p.parse::<u16>().ok());
            return (addr, port);
        }
        return (None, None);
    }

    if let Ok(addr) = value.parse::<IpAddr>() {
        return (Some(addr), None);
    }

    if let Some((host, port)) = value.rsplit_once(':') {
        if let (Ok(addr), Ok(port)) = (host.parse::<IpAddr>(), port.parse::<u16>()) {
            return (Some(addr), Some(port));
        }
    }

    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_names_and_preserves_values() {
        let headers = to_scope_headers([(&b"Content-Type"[..], &b"TeXt/Plain"[..])]);
        assert_eq!(headers[0].0.as_ref(), b"content-type");
        assert_eq!(headers[0].1.as_ref(), b"TeXt/Plain");
    }

    #[test]
    fn root_path_header_is_extracted_and_decoded() {
        let mut headers = to_scope_headers([
            (&b"Daphne-Root-Path"[..], &b"%2Fforum"[..]),
            (&b"Host"[..], &b"example.com"[..]),
        ]);
        let root_path = extract_root_path_header(&mut headers);
        assert_eq!(root_path.as_deref(), Some("/forum"));
        assert_eq!(headers.len(), 1);
        assert!(find_header(&headers, "daphne-root-path").is_none());
    }

    #[test]
    fn strips_root_path_prefix() {
        assert_eq!(strip_root_path("/forum/app", "/forum"), "/app");
        assert_eq!(strip_root_path("/other", "/forum"), "/other");
    }

    #[test]
    fn proxy_headers_pick_rightmost_by_default() {
        let headers = to_scope_headers([(
            &b"X-Forwarded-For"[..],
            &b"203.0.113.7, 10.0.0.1"[..],
        )]);
        let config = ProxyHeaderConfig {
            enabled: true,
            ..Default::default()
        };
        let rewrite = apply_proxy_headers(&headers, &config);
        assert_eq!(rewrite.client_ip, Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn proxy_headers_accept_ipv6_brackets() {
        let headers = to_scope_headers([(&b"X-Forwarded-For"[..], &b"[::1]:4000"[..])]);
        let config = ProxyHeaderConfig {
            enabled: true,
            trust: ForwardedTrust::Leftmost,
            ..Default::default()
        };
        let rewrite = apply_proxy_headers(&headers, &config);
        assert_eq!(rewrite.client_ip, Some("::1".parse().unwrap()));
        assert_eq!(rewrite.client_port, Some(4000));
    }
}
