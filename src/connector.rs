//! Socket connector seam.
//!
//! The transport and batch writer never name a TLS type; they ask a
//! [`Connector`] for a bidirectional byte stream. The default implementation
//! speaks TLS over TCP with webpki roots; tests substitute in-memory pipes.

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Anything that can carry the stream or a request/response exchange.
pub trait StreamSocket: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> StreamSocket for T {}

#[async_trait]
pub trait Connector: Send {
    /// Open a fresh connection to `host`. Called for the long-lived stream
    /// and again for every short-lived outbound request.
    async fn connect(&mut self, host: &str) -> io::Result<Box<dyn StreamSocket>>;
}

/// TLS connector over TCP port 443, verifying against the webpki root set.
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for TlsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&mut self, host: &str) -> io::Result<Box<dyn StreamSocket>> {
        let tcp = TcpStream::connect((host, 443)).await?;
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls = self.inner.connect(name, tcp).await?;
        Ok(Box::new(tls))
    }
}
