//! WireGuard key material.
//!
//! Keys are 32 raw bytes. The CLI and config files carry them base64
//! encoded (the `wg(8)` convention); the userspace UAPI carries them hex
//! encoded. Both decode to the same [`WgKey`].

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Length of every WireGuard key in bytes.
pub const KEY_LEN: usize = 32;

/// A 32-byte WireGuard key (public, private or pre-shared).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgKey([u8; KEY_LEN]);

impl WgKey {
    /// Wrap raw key bytes.
    pub const fn from_array(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a byte slice, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    /// Decode a standard (padded) base64 key.
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = BASE64
            .decode(s.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    /// Decode a lowercase or uppercase hex key.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut bytes =
            hex::decode(s.trim()).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    /// Generate 32 random bytes, suitable as a pre-shared key.
    pub fn generate_preshared() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Treat this key as an X25519 private key and derive its public half.
    pub fn public_key(&self) -> Self {
        let secret = StaticSecret::from(self.0);
        Self(*PublicKey::from(&secret).as_bytes())
    }
}

impl FromStr for WgKey {
    type Err = CryptoError;

    /// Accepts base64 (the `wg(8)` form) and falls back to hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() == KEY_LEN * 2 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Self::from_hex(s);
        }
        Self::from_base64(s)
    }
}

impl fmt::Debug for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WgKey").field(&self.to_base64()).finish()
    }
}

impl fmt::Display for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// An X25519 key pair for a tunnel interface.
pub struct KeyPair {
    private: WgKey,
    public: WgKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.to_base64())
            .field("private", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private: WgKey(secret.to_bytes()),
            public: WgKey(*public.as_bytes()),
        }
    }

    /// Reconstruct from an existing private key.
    pub fn from_private(private: WgKey) -> Self {
        Self {
            public: private.public_key(),
            private,
        }
    }

    pub const fn private_key(&self) -> &WgKey {
        &self.private
    }

    pub const fn public_key(&self) -> &WgKey {
        &self.public
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.private.0.zeroize();
    }
}
