//! `GuardMesh` key material
//!
//! - **Tunnel keys**: 32-byte WireGuard keys with base64/hex codecs and
//!   X25519 key-pair generation
//! - **Claim signatures**: Ed25519 verification of challenge nonces
//! - **Certificates**: CA, node and client certificates for the mTLS
//!   control API (`certs` feature)

#[cfg(feature = "certs")]
pub mod certs;
pub mod error;
pub mod keys;
pub mod signature;

pub use error::CryptoError;
pub use keys::{KEY_LEN, KeyPair, WgKey};
pub use signature::{ChallengeSigner, SIGNATURE_LEN, verify_challenge};
