use std::{future::Future, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::Result;
use rustls::{
    DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use rustls_native_certs::load_native_certs;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

use crate::{
    config::models::TlsConfig,
    core::route::{Address, Route},
    ports::transport::{BoxedTransport, Connector},
};

/// Largest proxy reply head accepted while setting up a tunnel
const MAX_TUNNEL_HEAD: usize = 64 * 1024;

/// TCP connector with rustls for https routes.
///
/// Responsibilities:
/// * Dials the route's socket address with `TCP_NODELAY`
/// * Opens a `CONNECT` tunnel when https goes through an HTTP proxy
/// * Performs the TLS handshake with ALPN `http/1.1`
///
/// Every phase is bounded by the connect timeout on its own.
pub struct TcpConnector {
    tls: TlsConnector,
}

impl TcpConnector {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let builder = rustls::ClientConfig::builder();
        let mut tls_config = if config.accept_invalid_certs {
            tracing::warn!("TLS certificate verification is disabled");
            let provider = CryptoProvider::get_default()
                .cloned()
                .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(native_roots())
                .with_no_client_auth()
        };
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            tls: TlsConnector::from(Arc::new(tls_config)),
        })
    }
}

fn native_roots() -> rustls::RootCertStore {
    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = load_native_certs();
    for cert in native_certs.certs {
        if root_cert_store.add(cert).is_err() {
            tracing::warn!("Failed to add native certificate to rustls RootCertStore");
        }
    }
    if !native_certs.errors.is_empty() {
        tracing::warn!(
            "Some native certificates failed to load: {:?}",
            native_certs.errors
        );
    }
    tracing::debug!("Loaded {} native root certificates", root_cert_store.len());
    root_cert_store
}

async fn bounded<T>(
    phase: &str,
    limit: Duration,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{phase} timed out after {limit:?}"),
        ))
    })
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, route: &Route, timeout: Duration) -> io::Result<BoxedTransport> {
        let mut stream = bounded("TCP connect", timeout, TcpStream::connect(route.socket_addr)).await?;
        stream.set_nodelay(true)?;

        if route.requires_tunnel() {
            bounded("proxy tunnel", timeout, open_tunnel(&mut stream, &route.address)).await?;
        }
        if !route.address.https {
            return Ok(Box::new(stream));
        }

        let server_name = ServerName::try_from(route.address.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls = bounded("TLS handshake", timeout, self.tls.connect(server_name, stream)).await?;
        tracing::debug!(route = %route, "TLS handshake complete");
        Ok(Box::new(tls))
    }
}

/// Ask an HTTP proxy to tunnel to `address` and wait for its 2xx reply.
async fn open_tunnel(stream: &mut TcpStream, address: &Address) -> io::Result<()> {
    let authority = address.authority();
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut head = Vec::with_capacity(512);
    let mut buf = [0u8; 512];
    let end = loop {
        if let Some(at) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            break at + 4;
        }
        if head.len() > MAX_TUNNEL_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy reply head too large",
            ));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection during tunnel setup",
            ));
        }
        head.extend_from_slice(&buf[..n]);
    };
    if end != head.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "proxy sent data before the tunnel was established",
        ));
    }

    let status_line = String::from_utf8_lossy(&head[..end]);
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);
    match status {
        200..=299 => Ok(()),
        407 => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "proxy authentication required",
        )),
        other => Err(io::Error::other(format!(
            "proxy refused tunnel to {authority} with status {other}"
        ))),
    }
}

/// Certificate verifier that accepts any server certificate but still checks
/// handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
