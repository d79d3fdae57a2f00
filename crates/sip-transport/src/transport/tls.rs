//! TLS wiring for stream connections (rustls).
//!
//! Handshake policy lives in the rustls configs supplied by the stack; the
//! engine only turns them into connectors/acceptors and tracks the TLS
//! sub-state on each connection.

use std::fmt;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, ClientConfig, PrivateKey, ServerConfig, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// TLS material for outbound connects and TLS listeners
#[derive(Clone)]
pub struct TlsSettings {
    /// Client-side config for outbound TLS connects
    pub client: Option<Arc<ClientConfig>>,
    /// Server-side config for TLS listeners
    pub server: Option<Arc<ServerConfig>>,
    /// Name presented for certificate validation on outbound connects;
    /// defaults to the peer IP
    pub server_name: Option<String>,
}

impl TlsSettings {
    pub fn client_only(client: Arc<ClientConfig>) -> Self {
        Self {
            client: Some(client),
            server: None,
            server_name: None,
        }
    }

    pub fn server_only(server: Arc<ServerConfig>) -> Self {
        Self {
            client: None,
            server: Some(server),
            server_name: None,
        }
    }

    pub(crate) fn connector(&self) -> Result<TlsConnector> {
        let config = self
            .client
            .clone()
            .ok_or(Error::IllegalAction("no TLS client configuration"))?;
        Ok(TlsConnector::from(config))
    }

    pub(crate) fn acceptor(&self) -> Result<TlsAcceptor> {
        let config = self
            .server
            .clone()
            .ok_or(Error::IllegalAction("no TLS server configuration"))?;
        Ok(TlsAcceptor::from(config))
    }

    pub(crate) fn server_name_for(&self, peer: SocketAddr) -> Result<ServerName> {
        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => peer.ip().to_string(),
        };
        ServerName::try_from(name.as_str())
            .map_err(|_| Error::Tls(format!("invalid TLS server name '{}'", name)))
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Load a PEM certificate chain
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Tls(format!("failed to open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("failed to parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Load a PEM private key (PKCS#8 or RSA)
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let open = || {
        std::fs::File::open(path)
            .map_err(|e| Error::Tls(format!("failed to open {}: {}", path.display(), e)))
    };
    let keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(open()?))
        .map_err(|e| Error::Tls(format!("failed to parse {}: {}", path.display(), e)))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }
    let keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(open()?))
        .map_err(|e| Error::Tls(format!("failed to parse {}: {}", path.display(), e)))?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}

/// Build a server config from PEM files on disk
pub fn server_config_from_pem(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}
