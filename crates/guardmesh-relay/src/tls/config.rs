//! rustls server configuration for the mutually authenticated control API.
//!
//! TLS 1.3 only. Every client must present a certificate chaining to the
//! configured CA.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tracing::info;

use super::certs::{CA_CERT_FILE, NODE_CERT_FILE, NODE_KEY_FILE};

/// TLS configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("File read error: {0}")]
    FileRead(String),

    #[error("Invalid PEM: {0}")]
    Pem(String),

    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Load `ca.crt`, `node.crt` and `node.key` from `cert_dir`.
pub fn load_server_config(cert_dir: &Path) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let read = |name: &str| {
        let path = cert_dir.join(name);
        std::fs::read(&path).map_err(|e| {
            TlsConfigError::FileRead(format!("Failed to read {}: {}", path.display(), e))
        })
    };
    let config = server_config_from_pem(
        &read(CA_CERT_FILE)?,
        &read(NODE_CERT_FILE)?,
        &read(NODE_KEY_FILE)?,
    )?;
    info!(cert_dir = %cert_dir.display(), "mTLS material loaded");
    Ok(config)
}

/// Build the server config from PEM bytes: CA bundle for client
/// verification, node certificate chain, node private key.
pub fn server_config_from_pem(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let provider = Arc::new(ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(ca_pem) {
        let cert = cert.map_err(|e| TlsConfigError::Pem(format!("CA certificate: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| TlsConfigError::Config(format!("CA certificate rejected: {e}")))?;
    }
    if roots.is_empty() {
        return Err(TlsConfigError::Pem("no CA certificate found".into()));
    }

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| TlsConfigError::Config(e.to_string()))?;

    let chain = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::Pem(format!("node certificate: {e}")))?;
    if chain.is_empty() {
        return Err(TlsConfigError::Pem("no node certificate found".into()));
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| TlsConfigError::Pem(format!("node key: {e}")))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TlsConfigError::Config(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| TlsConfigError::Config(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tls::certs::{generate_dev_bundle, write_dev_certs};

    #[test]
    fn builds_from_dev_bundle() {
        let bundle = generate_dev_bundle(&["localhost"], "admin").unwrap();
        let config = server_config_from_pem(
            bundle.ca_cert_pem.as_bytes(),
            bundle.node_cert_pem.as_bytes(),
            bundle.node_key_pem.as_bytes(),
        )
        .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn empty_ca_is_rejected() {
        let bundle = generate_dev_bundle(&["localhost"], "admin").unwrap();
        let err = server_config_from_pem(
            b"",
            bundle.node_cert_pem.as_bytes(),
            bundle.node_key_pem.as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, TlsConfigError::Pem(_)));
    }

    #[test]
    fn missing_key_is_rejected() {
        let bundle = generate_dev_bundle(&["localhost"], "admin").unwrap();
        let err = server_config_from_pem(
            bundle.ca_cert_pem.as_bytes(),
            bundle.node_cert_pem.as_bytes(),
            b"",
        )
        .unwrap_err();
        assert!(matches!(err, TlsConfigError::Pem(_)));
    }

    #[test]
    fn loads_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = generate_dev_bundle(&["localhost"], "admin").unwrap();
        write_dev_certs(dir.path(), &bundle).unwrap();
        assert!(load_server_config(dir.path()).is_ok());
    }

    #[test]
    fn missing_directory_is_a_read_error() {
        let err = load_server_config(Path::new("/nonexistent/certs")).unwrap_err();
        assert!(matches!(err, TlsConfigError::FileRead(_)));
    }
}
