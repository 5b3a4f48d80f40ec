//! Crypto error types.

/// Errors from key handling and signature verification.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid key encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength { expected: usize, actual: usize },

    #[error("Public key is not a valid Ed25519 point")]
    InvalidVerifyingKey,

    #[error("Signature verification failed")]
    SignatureMismatch,
}
