//! Optional session encryption.
//!
//! Sessions are encrypted when the listener carries TLS material and the
//! client trusts its chain; otherwise the protocol runs over plaintext TCP.
//! Material is loaded from PEM files once, at configuration time.

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("open {}: {e}", path.display())))?;
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|e| Error::Tls(format!("read {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("read {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}

/// Listener-side TLS: certificate chain plus private key.
pub struct TlsServerConfig {
    acceptor: TlsAcceptor,
}

impl TlsServerConfig {
    pub fn new(chain_path: PathBuf, key_path: PathBuf) -> Result<TlsServerConfig> {
        let certs = load_certs(&chain_path)?;
        let key = load_key(&key_path)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Tls(format!("build server config: {e}")))?;
        Ok(TlsServerConfig {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }
}

/// Dialer-side TLS: trusted roots plus the name to verify.
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    pub ca_path: PathBuf,
    pub server_name: String,
}

impl TlsClientConfig {
    pub fn new(ca_path: PathBuf, server_name: impl Into<String>) -> TlsClientConfig {
        TlsClientConfig {
            ca_path,
            server_name: server_name.into(),
        }
    }

    pub fn connector(&self) -> Result<(TlsConnector, ServerName<'static>)> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.ca_path)? {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("trust root: {e}")))?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|e| Error::Tls(format!("server name {:?}: {e}", self.server_name)))?;
        Ok((TlsConnector::from(Arc::new(config)), server_name))
    }
}
