//! TLS-wrapped endpoints (spec §3, §4.1).
//!
//! Certificate acquisition and renewal are explicitly out of scope (spec
//! §1); [`TlsConfig`] only accepts an already-loaded certificate chain and
//! key, mirroring how `axum-server`'s `tls-rustls` feature (see the
//! `ckir-rsdev` pack entry) layers `tokio-rustls` underneath an otherwise
//! ordinary listener rather than owning certificate lifecycle itself.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::error::Error;

/// A loaded certificate chain + private key, optionally with an SNI map for
/// serving multiple certificates off one listener.
#[derive(Clone)]
pub struct TlsConfig {
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Build a TLS config from an already-parsed certificate chain and key.
    /// ALPN advertises `h2` then `http/1.1`, so the peer's negotiated
    /// protocol tells the caller which of spec §4.2/§4.3 applies.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, Error> {
        let mut config = RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(Error::configuration)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Run the TLS handshake over an accepted transport, returning the
    /// encrypted stream, or `None` on handshake failure (the connection is
    /// simply dropped, same as `axum`'s `ListenerExt::handshake` contract).
    pub async fn handshake<IO>(&self, io: IO) -> Option<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.acceptor.accept(io).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::debug!("TLS handshake failed: {e}");
                None
            }
        }
    }
}

/// Which wire protocol ALPN selected, per spec §4.1 "TLS descriptors
/// negotiate ALPN and select HTTP/1.1 or HTTP/2".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    Http1,
    Http2,
}

/// Inspect the ALPN result of a completed handshake.
pub fn negotiated_protocol<IO>(stream: &TlsStream<IO>) -> NegotiatedProtocol {
    let (_, session) = stream.get_ref();
    match session.alpn_protocol() {
        Some(proto) if proto == b"h2" => NegotiatedProtocol::Http2,
        _ => NegotiatedProtocol::Http1,
    }
}
