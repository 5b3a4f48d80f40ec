//! Development certificate bundle for the control API.
//!
//! Generates a CA, a node certificate and one client certificate and writes
//! them in the layout [`load_server_config`](super::load_server_config)
//! expects. Production deployments bring their own PKI.

use std::path::Path;

use guardmesh_crypto::certs::{generate_ca, generate_client_cert, generate_node_cert};
use tracing::info;

pub const CA_CERT_FILE: &str = "ca.crt";
pub const NODE_CERT_FILE: &str = "node.crt";
pub const NODE_KEY_FILE: &str = "node.key";
pub const CLIENT_CERT_FILE: &str = "client.crt";
pub const CLIENT_KEY_FILE: &str = "client.key";

/// Generated certificate bundle (PEM-encoded).
pub struct DevBundle {
    pub ca_cert_pem: String,
    pub node_cert_pem: String,
    pub node_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

/// Generate a CA plus node and client certificates signed by it.
pub fn generate_dev_bundle(server_names: &[&str], client_cn: &str) -> Result<DevBundle, CertError> {
    let ca = generate_ca("GuardMesh Dev").map_err(|e| CertError::Generation(e.to_string()))?;
    let node =
        generate_node_cert(&ca, server_names).map_err(|e| CertError::Generation(e.to_string()))?;
    let client =
        generate_client_cert(&ca, client_cn).map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(DevBundle {
        ca_cert_pem: ca.ca_cert_pem,
        node_cert_pem: node.cert_pem,
        node_key_pem: node.key_pem,
        client_cert_pem: client.cert_pem,
        client_key_pem: client.key_pem,
    })
}

/// Write a dev certificate bundle to `dir`, creating it if needed.
pub fn write_dev_certs(dir: &Path, bundle: &DevBundle) -> Result<(), CertError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| CertError::Io(format!("Failed to create cert dir: {e}")))?;

    let files = [
        (CA_CERT_FILE, &bundle.ca_cert_pem),
        (NODE_CERT_FILE, &bundle.node_cert_pem),
        (NODE_KEY_FILE, &bundle.node_key_pem),
        (CLIENT_CERT_FILE, &bundle.client_cert_pem),
        (CLIENT_KEY_FILE, &bundle.client_key_pem),
    ];
    for (name, pem) in files {
        std::fs::write(dir.join(name), pem)
            .map_err(|e| CertError::Io(format!("Failed to write {name}: {e}")))?;
    }

    info!(dir = %dir.display(), "Dev certificates written");
    Ok(())
}

/// Certificate generation errors.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("I/O error: {0}")]
    Io(String),
}
