//! QUIC client for the fast path (quinn)
//!
//! Endpoints look like `quic://host:port/path` or `https://host:port/path`;
//! only host and port are used. The port defaults to 4433.

use async_trait::async_trait;
use bytes::Bytes;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Connection, ConnectionError, Endpoint, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Once};
use tracing::{debug, info};

use super::{MuxConnection, MuxConnector, UniRecvStream, UniSendStream};
use crate::config::FastPathConfig;
use crate::error::{AppError, Result};

const DEFAULT_PORT: u16 = 4433;

static RUSTLS_PROVIDER_INIT: Once = Once::new();

fn ensure_rustls_provider() {
    RUSTLS_PROVIDER_INIT.call_once(|| {
        if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
            // another provider was installed first; rustls uses that one
            debug!("rustls provider already installed: {:?}", e);
        }
    });
}

/// Host and port parsed from a transport endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddr {
    pub host: String,
    pub port: u16,
}

impl EndpointAddr {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let rest = endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(endpoint);
        let authority = rest.split(['/', '?']).next().unwrap_or_default();
        if authority.is_empty() {
            return Err(AppError::Establishment(format!("no host in endpoint '{}'", endpoint)));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // [v6]:port
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| AppError::Establishment(format!("bad IPv6 host in '{}'", endpoint)))?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => return Err(AppError::Establishment(format!("bad port in '{}'", endpoint))),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| AppError::Establishment(format!("bad port '{}' in '{}'", p, endpoint)))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Opens QUIC connections to relay endpoints
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    pub fn new(config: &FastPathConfig) -> Result<Self> {
        let client_config = client_config(config)?;
        let mut endpoint = Endpoint::client(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
        endpoint.set_default_client_config(client_config);
        info!("QUIC client endpoint bound on {:?}", endpoint.local_addr().ok());
        Ok(Self { endpoint })
    }
}

fn client_config(config: &FastPathConfig) -> Result<ClientConfig> {
    ensure_rustls_provider();

    let builder = rustls::ClientConfig::builder();
    let mut crypto = if config.accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let path = config.ca_cert.as_deref().ok_or_else(|| {
            AppError::Config("fast_path.ca_cert is required unless accept_invalid_certs is set".to_string())
        })?;
        builder
            .with_root_certificates(load_roots(path)?)
            .with_no_client_auth()
    };
    crypto.alpn_protocols = config.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    let quic = QuicClientConfig::try_from(crypto)
        .map_err(|e| AppError::Config(format!("QUIC client config: {}", e)))?;
    Ok(ClientConfig::new(Arc::new(quic)))
}

fn load_roots(path: &str) -> Result<rustls::RootCertStore> {
    let pem = std::fs::read(path)
        .map_err(|e| AppError::Config(format!("Failed to read CA file {}: {}", path, e)))?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| AppError::Config(format!("Bad certificate in {}: {}", path, e)))?;
        roots
            .add(cert)
            .map_err(|e| AppError::Config(format!("Rejected certificate in {}: {}", path, e)))?;
    }
    if roots.is_empty() {
        return Err(AppError::Config(format!("No certificates found in {}", path)));
    }
    Ok(roots)
}

#[async_trait]
impl MuxConnector for QuicConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn MuxConnection>> {
        let target = EndpointAddr::parse(endpoint)?;
        let addr = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|e| AppError::Establishment(format!("Failed to resolve {}: {}", target.host, e)))?
            .next()
            .ok_or_else(|| AppError::Establishment(format!("No address for {}", target.host)))?;

        let connecting = self
            .endpoint
            .connect(addr, &target.host)
            .map_err(|e| AppError::Establishment(format!("Failed to start QUIC connect: {}", e)))?;
        let connection = connecting
            .await
            .map_err(|e| AppError::Establishment(format!("QUIC handshake with {} failed: {}", addr, e)))?;

        info!("QUIC connection established with {}", addr);
        Ok(Arc::new(QuicConnection { connection }))
    }
}

/// `true` for the ways a connection ends without being an error
fn is_closed(e: &ConnectionError) -> bool {
    matches!(
        e,
        ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed | ConnectionError::ConnectionClosed(_)
    )
}

struct QuicConnection {
    connection: Connection,
}

#[async_trait]
impl MuxConnection for QuicConnection {
    async fn open_uni(&self) -> Result<UniSendStream> {
        let stream = self
            .connection
            .open_uni()
            .await
            .map_err(|e| AppError::Transport(format!("open_uni failed: {}", e)))?;
        Ok(Box::new(stream))
    }

    async fn accept_uni(&self) -> Result<Option<UniRecvStream>> {
        match self.connection.accept_uni().await {
            Ok(stream) => Ok(Some(Box::new(stream))),
            Err(e) if is_closed(&e) => Ok(None),
            Err(e) => Err(AppError::StreamRead(e.to_string())),
        }
    }

    fn send_datagram(&self, data: Bytes) -> Result<()> {
        self.connection
            .send_datagram(data)
            .map_err(|e| AppError::Transport(format!("send_datagram failed: {}", e)))
    }

    async fn read_datagram(&self) -> Result<Option<Bytes>> {
        match self.connection.read_datagram().await {
            Ok(data) => Ok(Some(data)),
            Err(e) if is_closed(&e) => Ok(None),
            Err(e) => Err(AppError::DatagramRead(e.to_string())),
        }
    }

    fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"closed");
    }
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
