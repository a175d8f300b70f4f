//! Authenticated channel establishment for relay tunnels
//!
//! A connector opens a byte channel to the relay and reports which sub-protocol the peer
//! agreed to speak. The tunnel client decides whether that protocol is acceptable.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, instrument, warn};

use crate::error::{RelayError, Result};

/// Byte channel carrying tunnel frames or downstream client traffic
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An opened channel plus the sub-protocol negotiated on it
pub struct NegotiatedChannel {
    pub channel: Box<dyn Channel>,
    pub protocol: Option<String>,
}

/// Opens authenticated channels to relay endpoints
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, host: &str, port: u16) -> Result<NegotiatedChannel>;
}

/// TLS connector offering a fixed ALPN list
///
/// Relay certificates are verified against the native roots plus an optional PEM bundle.
pub struct TlsChannelConnector {
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsChannelConnector {
    /// Create a connector advertising `protocols` through ALPN
    pub fn new(
        protocols: &[&str],
        connect_timeout: Duration,
        ca_file: Option<&Path>,
    ) -> Result<Self> {
        let mut root_store = RootCertStore::empty();

        let native_certs = rustls_native_certs::load_native_certs()
            .map_err(|e| RelayError::Tls(format!("failed to load native certificates: {}", e)))?;
        let mut skipped = 0usize;
        for cert in native_certs {
            if root_store.add(&Certificate(cert.0)).is_err() {
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!("Skipped {} unparsable native certificates", skipped);
        }

        if let Some(path) = ca_file {
            let added = add_pem_file(&mut root_store, path)?;
            info!("Trusting {} certificates from {}", added, path.display());
        }

        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            connect_timeout,
        })
    }
}

/// Add every certificate in a PEM bundle; an empty or unparsable bundle is an error
fn add_pem_file(root_store: &mut RootCertStore, path: &Path) -> Result<usize> {
    let file = File::open(path).map_err(|e| {
        RelayError::Tls(format!("failed to open CA file {}: {}", path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).map_err(|e| {
        RelayError::Tls(format!("failed to read CA file {}: {}", path.display(), e))
    })?;

    let (added, _) = root_store.add_parsable_certificates(&certs);
    if added == 0 {
        return Err(RelayError::Tls(format!(
            "no usable certificates in {}",
            path.display()
        )));
    }
    Ok(added)
}

#[async_trait]
impl ChannelConnector for TlsChannelConnector {
    #[instrument(skip(self))]
    async fn open(&self, host: &str, port: u16) -> Result<NegotiatedChannel> {
        let tcp = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RelayError::ChannelConnect(format!("connect to {}:{} timed out", host, port)))?
            .map_err(|e| RelayError::ChannelConnect(format!("TCP connect failed: {}", e)))?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(host)
            .map_err(|e| RelayError::Tls(format!("invalid server name {}: {}", host, e)))?;

        let tls = timeout(self.connect_timeout, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| RelayError::Tls(format!("handshake with {}:{} timed out", host, port)))?
            .map_err(|e| RelayError::Tls(format!("handshake failed: {}", e)))?;

        let protocol = tls
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());
        debug!(protocol = ?protocol, "TLS channel established");

        Ok(NegotiatedChannel {
            channel: Box::new(tls),
            protocol,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "egress-relay-{}-{}",
            std::process::id(),
            name
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_missing_ca_file_is_an_error() {
        let mut root_store = RootCertStore::empty();
        let err = add_pem_file(&mut root_store, Path::new("/nonexistent/relay-ca.pem")).unwrap_err();
        assert!(matches!(err, RelayError::Tls(ref msg) if msg.contains("failed to open")));
    }

    #[test]
    fn test_ca_file_without_certificates_is_an_error() {
        let path = temp_file("empty.pem", "not a certificate\n");
        let mut root_store = RootCertStore::empty();

        let err = add_pem_file(&mut root_store, &path).unwrap_err();
        assert!(matches!(err, RelayError::Tls(ref msg) if msg.contains("no usable certificates")));
        assert!(root_store.is_empty());

        std::fs::remove_file(path).unwrap();
    }
}
