//! Upstream connections
//!
//! This module dials backend servers, over plain TCP or TLS depending on the
//! route, and reads their response heads.

use bytes::{Buf, BytesMut};
use rustls::pki_types::ServerName;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::http::parser::{parse_response_head, ParseError};
use crate::http::response::ResponseHead;
use crate::proxy::dispatch::host_without_port;

/// Default buffer size for streaming
pub const BUFFER_SIZE: usize = 8192;

/// A byte stream to a backend, TLS or not.
pub trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendIo for T {}

pub type BackendStream = Box<dyn BackendIo>;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake with {addr} failed: {source}")]
    Tls {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid tls configuration: {0}")]
    TlsConfig(#[from] rustls::Error),

    #[error("backend response headers too large")]
    HeadersTooLarge,

    #[error("backend closed the connection before responding")]
    EmptyResponse,

    #[error("malformed backend response: {0:?}")]
    Malformed(ParseError),

    #[error("websocket handshake rejected with status {0}")]
    Rejected(u16),

    #[error("backend timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::ConnectTimeout(_) | UpstreamError::Timeout)
    }
}

/// Dials backends with a fixed connect deadline
#[derive(Clone)]
pub struct Upstream {
    connect_timeout: Duration,
    tls: TlsConnector,
}

impl Upstream {
    /// Create a dialer. With `tls_skip_verify` set, TLS backends are not
    /// asked for a certificate chain we trust.
    pub fn new(connect_timeout: Duration, tls_skip_verify: bool) -> Result<Self, UpstreamError> {
        let config = tls_client_config(tls_skip_verify)?;

        Ok(Self {
            connect_timeout,
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Connect to `addr`, negotiating TLS when `secure` is set.
    ///
    /// `host` is the Host the backend will see; it doubles as the TLS server
    /// name when it is a DNS name, otherwise the backend IP is used.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        secure: bool,
        host: &str,
    ) -> Result<BackendStream, UpstreamError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| UpstreamError::ConnectTimeout(addr))?
            .map_err(|source| UpstreamError::Connect { addr, source })?;
        let _ = stream.set_nodelay(true);

        tracing::trace!(%addr, secure, "connected to backend");

        if !secure {
            return Ok(Box::new(stream));
        }

        let server_name = tls_server_name(host, addr.ip());
        let tls = timeout(self.connect_timeout, self.tls.connect(server_name, stream))
            .await
            .map_err(|_| UpstreamError::ConnectTimeout(addr))?
            .map_err(|source| UpstreamError::Tls { addr, source })?;

        Ok(Box::new(tls))
    }
}

/// Read a response head from `stream`, leaving any body bytes that arrived
/// with it in `buffer`.
pub async fn read_response_head<R>(
    stream: &mut R,
    buffer: &mut BytesMut,
    idle_timeout: Duration,
) -> Result<ResponseHead, UpstreamError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        match parse_response_head(&buffer[..]) {
            Ok((head, consumed)) => {
                buffer.advance(consumed);
                return Ok(head);
            }
            Err(ParseError::Incomplete) => {}
            Err(ParseError::HeadersTooLarge) => return Err(UpstreamError::HeadersTooLarge),
            Err(e) => return Err(UpstreamError::Malformed(e)),
        }

        let n = timeout(idle_timeout, stream.read_buf(buffer))
            .await
            .map_err(|_| UpstreamError::Timeout)??;

        if n == 0 {
            return Err(UpstreamError::EmptyResponse);
        }
    }
}

fn tls_server_name(host: &str, ip: IpAddr) -> ServerName<'static> {
    ServerName::try_from(host_without_port(host).to_string())
        .unwrap_or_else(|_| ServerName::IpAddress(ip.into()))
}

fn tls_client_config(skip_verify: bool) -> Result<rustls::ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = if skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(config)
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};
    use std::sync::Arc;

    /// Accepts any server certificate. Signatures are still checked.
    #[derive(Debug)]
    pub struct NoVerifier(pub Arc<CryptoProvider>);

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
