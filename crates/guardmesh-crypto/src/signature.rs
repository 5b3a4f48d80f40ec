//! Ed25519 challenge signatures for the IP-claim protocol.
//!
//! A user proves possession of the private half of their registered key by
//! signing the raw nonce bytes issued by the relay.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::CryptoError;
use crate::keys::WgKey;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Verify `signature` over `message` with the registered 32-byte public key.
pub fn verify_challenge(
    public_key: &WgKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let signature: &[u8; SIGNATURE_LEN] =
        signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignatureLength {
                expected: SIGNATURE_LEN,
                actual: signature.len(),
            })?;
    let verifying = VerifyingKey::from_bytes(public_key.as_bytes())
        .map_err(|_| CryptoError::InvalidVerifyingKey)?;
    verifying
        .verify(message, &Signature::from_bytes(signature))
        .map_err(|_| CryptoError::SignatureMismatch)
}

/// Client-side signer for claim challenges.
pub struct ChallengeSigner {
    signing: SigningKey,
}

impl std::fmt::Debug for ChallengeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeSigner")
            .field("public", &self.public_key().to_base64())
            .finish_non_exhaustive()
    }
}

impl ChallengeSigner {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a signer from its 32-byte seed.
    pub fn from_seed(seed: &WgKey) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed.as_bytes()),
        }
    }

    /// The public key to register for this user.
    pub fn public_key(&self) -> WgKey {
        WgKey::from_array(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_verifies() {
        let signer = ChallengeSigner::generate();
        let nonce = [42u8; 32];
        let sig = signer.sign(&nonce);
        verify_challenge(&signer.public_key(), &nonce, &sig).unwrap();
    }

    #[test]
    fn signature_over_other_message_fails() {
        let signer = ChallengeSigner::generate();
        let sig = signer.sign(b"nonce-a");
        assert!(matches!(
            verify_challenge(&signer.public_key(), b"nonce-b", &sig),
            Err(CryptoError::SignatureMismatch)
        ));
    }

    #[test]
    fn signature_from_other_key_fails() {
        let alice = ChallengeSigner::generate();
        let mallory = ChallengeSigner::generate();
        let sig = mallory.sign(b"nonce");
        assert!(verify_challenge(&alice.public_key(), b"nonce", &sig).is_err());
    }

    #[test]
    fn truncated_signature_is_rejected() {
        let signer = ChallengeSigner::generate();
        let sig = signer.sign(b"nonce");
        assert!(matches!(
            verify_challenge(&signer.public_key(), b"nonce", &sig[..63]),
            Err(CryptoError::InvalidSignatureLength { actual: 63, .. })
        ));
    }

    #[test]
    fn seed_roundtrip_keeps_public_key() {
        let seed = WgKey::generate_preshared();
        let a = ChallengeSigner::from_seed(&seed);
        let b = ChallengeSigner::from_seed(&seed);
        assert_eq!(a.public_key(), b.public_key());
    }
}
