//! mTLS material for the control API: loading and dev generation.

pub mod certs;
pub mod config;

pub use certs::{CertError, DevBundle, generate_dev_bundle, write_dev_certs};
pub use config::{TlsConfigError, load_server_config, server_config_from_pem};
