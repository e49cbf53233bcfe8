//! TCP and TLS transport for sessions.
//!
//! A session holds an [`IoStream`] directly. Socket options such as buffer
//! sizes are reached through the underlying `TcpStream`, whichever layer
//! wraps it.

use crate::error::SessionError;
use socket2::SockRef;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Unified stream type: plain TCP, TLS, or an in-process pipe
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// In-process pipe, no socket options
    Memory(DuplexStream),
    /// TLS-wrapped stream
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl std::fmt::Debug for IoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            IoStream::Plain(_) => "Plain",
            IoStream::Memory(_) => "Memory",
            #[cfg(feature = "tls")]
            IoStream::Tls(_) => "Tls",
            #[cfg(feature = "tls")]
            IoStream::TlsClient(_) => "TlsClient",
        };
        f.debug_tuple("IoStream").field(&kind).finish()
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Memory(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Memory(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Memory(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Memory(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// The TCP socket underneath, if any
    pub fn tcp(&self) -> Option<&TcpStream> {
        match self {
            IoStream::Plain(stream) => Some(stream),
            IoStream::Memory(_) => None,
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Some(stream.get_ref().0),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Some(stream.get_ref().0),
        }
    }

    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self.tcp() {
            Some(stream) => stream.peer_addr(),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "in-process stream has no peer address",
            )),
        }
    }

    /// Kernel receive buffer size
    pub fn recv_buffer_size(&self) -> Option<usize> {
        self.tcp()
            .and_then(|s| SockRef::from(s).recv_buffer_size().ok())
    }

    /// Kernel send buffer size
    pub fn send_buffer_size(&self) -> Option<usize> {
        self.tcp()
            .and_then(|s| SockRef::from(s).send_buffer_size().ok())
    }

    /// Set the kernel receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> std::io::Result<()> {
        match self.tcp() {
            Some(s) => SockRef::from(s).set_recv_buffer_size(size),
            None => Ok(()),
        }
    }

    /// Set the kernel send buffer size
    pub fn set_send_buffer_size(&self, size: usize) -> std::io::Result<()> {
        match self.tcp() {
            Some(s) => SockRef::from(s).set_send_buffer_size(size),
            None => Ok(()),
        }
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Connect to a TCP address, giving up after `timeout`
pub async fn connect_tcp_timeout(
    addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream, SessionError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            debug!("Connect to {} timed out after {:?}", addr, timeout);
            Err(SessionError::ConnectTimeout(timeout))
        }
    }
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS handshakes run before a session is created
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::info;

    /// TLS server acceptor wrapper
    #[derive(Clone)]
    pub struct TlsServer {
        acceptor: TlsAcceptor,
    }

    fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
        let certs = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate chain")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }
        Ok(certs)
    }

    fn load_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut pem.as_bytes())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))
    }

    fn load_roots(pem: &str) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for ca_cert in load_certs(pem)? {
            roots
                .add(ca_cert)
                .context("Failed to add CA certificate to root store")?;
        }
        Ok(roots)
    }

    /// Create a TLS server configuration. With `ca_pem`, clients must present
    /// a certificate signed by that CA.
    pub fn make_server_config(
        cert_chain_pem: &str,
        private_key_pem: &str,
        ca_pem: Option<&str>,
    ) -> Result<ServerConfig> {
        info!("Creating TLS server configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = load_certs(cert_chain_pem)?;
        let key = load_key(private_key_pem)?;

        let builder = ServerConfig::builder();
        let config = match ca_pem {
            Some(ca_pem) => {
                let verifier =
                    rustls::server::WebPkiClientVerifier::builder(Arc::new(load_roots(ca_pem)?))
                        .build()
                        .context("Failed to build client certificate verifier")?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key),
        }
        .context("Failed to configure server certificate")?;

        Ok(config)
    }

    /// Create a TLS client configuration trusting `ca_pem`, optionally
    /// presenting a client certificate
    pub fn make_client_config(
        ca_pem: &str,
        client_identity: Option<(&str, &str)>,
    ) -> Result<ClientConfig> {
        info!("Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let builder = ClientConfig::builder().with_root_certificates(load_roots(ca_pem)?);
        let config = match client_identity {
            Some((cert_chain_pem, private_key_pem)) => builder
                .with_client_auth_cert(load_certs(cert_chain_pem)?, load_key(private_key_pem)?)
                .context("Failed to configure client certificate")?,
            None => builder.with_no_client_auth(),
        };
        Ok(config)
    }

    /// Create TLS acceptor from server configuration
    pub fn tls_acceptor(config: ServerConfig) -> TlsServer {
        TlsServer {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Run the server side of the handshake
    pub async fn accept_tls(acceptor: &TlsServer, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer = tcp_stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!("Accepting TLS connection from {}", peer);

        let tls_stream = acceptor
            .acceptor
            .accept(tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {}", peer))?;

        Ok(IoStream::Tls(tls_stream))
    }

    /// Run the client side of the handshake
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<IoStream> {
        let peer = tcp_stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!("Connecting via TLS to {} (SNI: {})", peer, sni);

        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", sni))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {} (SNI: {})", peer, sni))?;

        Ok(IoStream::TlsClient(tls_stream))
    }
}
