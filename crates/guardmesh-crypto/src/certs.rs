//! Certificate generation for the mutually authenticated control API.
//!
//! Provides a self-signed CA plus node (server) and client certificates
//! signed by it. Operators normally bring their own PKI; these helpers back
//! `guardmesh gen-certs` and the TLS tests.
//!
//! Requires the `certs` feature to be enabled.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};

/// CA material for signing node and client certificates.
pub struct CaBundle {
    /// CA certificate parameters (needed for signing).
    pub params: CertificateParams,
    /// CA key pair.
    pub key_pair: KeyPair,
    /// PEM-encoded CA certificate.
    pub ca_cert_pem: String,
}

/// A PEM-encoded leaf certificate and its private key.
pub struct LeafBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Certificate generation errors.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    /// An error occurred during certificate generation or signing.
    #[error("Certificate generation error: {0}")]
    Generation(String),
}

fn generation(e: rcgen::Error) -> CertError {
    CertError::Generation(e.to_string())
}

/// Generate a self-signed CA.
pub fn generate_ca(org_name: &str) -> Result<CaBundle, CertError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{org_name} CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    let key_pair = KeyPair::generate().map_err(generation)?;
    let ca_cert = params.self_signed(&key_pair).map_err(generation)?;

    Ok(CaBundle {
        ca_cert_pem: ca_cert.pem(),
        params,
        key_pair,
    })
}

/// Generate a node certificate for the control API, valid for `server_names`.
pub fn generate_node_cert(ca: &CaBundle, server_names: &[&str]) -> Result<LeafBundle, CertError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    let mut params = CertificateParams::new(
        server_names
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    )
    .map_err(generation)?;
    params
        .distinguished_name
        .push(DnType::CommonName, "GuardMesh Relay Node");
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);

    let key = KeyPair::generate().map_err(generation)?;
    let cert = params.signed_by(&key, &issuer).map_err(generation)?;

    Ok(LeafBundle {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Generate a client certificate with `common_name` as its CN.
pub fn generate_client_cert(ca: &CaBundle, common_name: &str) -> Result<LeafBundle, CertError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);

    let key = KeyPair::generate().map_err(generation)?;
    let cert = params.signed_by(&key, &issuer).map_err(generation)?;

    Ok(LeafBundle {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generate_ca_produces_valid_pem() {
        let ca = generate_ca("GuardMesh Test").unwrap();
        assert!(ca.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_cert_pem.contains("END CERTIFICATE"));
    }

    #[test]
    fn node_and_client_certs_differ() {
        let ca = generate_ca("GuardMesh Test").unwrap();
        let node = generate_node_cert(&ca, &["localhost", "127.0.0.1"]).unwrap();
        let client = generate_client_cert(&ca, "admin").unwrap();

        assert!(node.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(node.key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(client.key_pem.contains("BEGIN PRIVATE KEY"));
        assert_ne!(node.cert_pem, client.cert_pem);
        assert_ne!(node.cert_pem, ca.ca_cert_pem);
    }
}
