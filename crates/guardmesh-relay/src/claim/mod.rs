//! IP-claim protocol.
//!
//! Phase 1 (`sig` absent) issues a 32-byte nonce for the user. Phase 2
//! (`sig` present) consumes the nonce, checks the Ed25519 signature against
//! the user's registered key and, if the address is free, records it as the
//! user's latest address.

mod handler;
mod nonce;

pub use handler::{Challenge, ClaimError, ClaimHandler, ClaimRequest, ClaimResponse, Verdict};
pub use nonce::{Consumed, MAX_NONCE_TTL, NONCE_LEN, Nonce, NonceStore};
