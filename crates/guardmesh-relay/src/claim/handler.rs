//! Two-phase IP claim: challenge, then signed verification and a
//! conditional registry write.

use std::net::IpAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use guardmesh_core::net::parse_ip;
use guardmesh_core::{ErrorKind, Field, ValidationError};
use guardmesh_crypto::verify_challenge;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::nonce::{Consumed, NonceStore};
use crate::storage::{RegistryDatabase, RegistryError};

/// Body of `POST /ip/replace`. A missing or empty `sig` requests a challenge.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRequest {
    pub user_id: i64,
    pub ip_address: String,
    #[serde(default)]
    pub sig: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Hex-encoded nonce to sign.
    pub nonce: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub free: bool,
    pub written: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ClaimResponse {
    Challenge(Challenge),
    Verdict(Verdict),
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no active challenge")]
    NoActiveChallenge,

    #[error("challenge expired")]
    Expired,

    /// Unknown user or bad signature; the two are not distinguished.
    #[error("claim rejected")]
    Rejected,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ClaimError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NoActiveChallenge | Self::Expired | Self::Rejected => ErrorKind::Auth,
            Self::Registry(e) => e.kind(),
        }
    }
}

#[derive(Clone)]
pub struct ClaimHandler {
    db: RegistryDatabase,
    nonces: NonceStore,
}

impl ClaimHandler {
    pub const fn new(db: RegistryDatabase, nonces: NonceStore) -> Self {
        Self { db, nonces }
    }

    pub const fn nonces(&self) -> &NonceStore {
        &self.nonces
    }

    pub async fn handle(&self, req: ClaimRequest) -> Result<ClaimResponse, ClaimError> {
        let address = parse_ip(Field::Address, &req.ip_address)?;
        match req.sig.as_deref().filter(|s| !s.is_empty()) {
            None => Ok(ClaimResponse::Challenge(self.challenge(req.user_id).await)),
            Some(sig) => Ok(ClaimResponse::Verdict(
                self.verify(req.user_id, address, sig).await?,
            )),
        }
    }

    /// Phase 1. Issued for any user id so the response reveals nothing.
    pub async fn challenge(&self, user_id: i64) -> Challenge {
        let nonce = self.nonces.issue(user_id).await;
        debug!(user_id, "Claim challenge issued");
        Challenge {
            nonce: hex::encode(nonce),
        }
    }

    /// Phase 2. The challenge is consumed before anything else is checked.
    pub async fn verify(
        &self,
        user_id: i64,
        address: IpAddr,
        sig_b64: &str,
    ) -> Result<Verdict, ClaimError> {
        let nonce = match self.nonces.consume(user_id).await {
            Consumed::Live(nonce) => nonce,
            Consumed::Expired => return Err(ClaimError::Expired),
            Consumed::Missing => return Err(ClaimError::NoActiveChallenge),
        };

        let sig = BASE64
            .decode(sig_b64.trim())
            .map_err(|e| ValidationError::new(Field::Signature, e.to_string()))?;

        let key = match self.db.get_user_public_key(user_id).await {
            Ok(key) => key,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(user_id, "Claim for unknown user");
                return Err(ClaimError::Rejected);
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = verify_challenge(&key, &nonce, &sig) {
            debug!(user_id, error = %e, "Claim signature rejected");
            return Err(ClaimError::Rejected);
        }

        if self.db.address_held_by_other(user_id, address).await? {
            info!(user_id, %address, "Claim refused, address held by another user");
            return Ok(Verdict {
                free: false,
                written: false,
            });
        }

        let written = self.db.set_user_latest_address(user_id, address).await?;
        if !written && self.db.address_held_by_other(user_id, address).await? {
            info!(user_id, %address, "Claim lost a race for the address");
            return Ok(Verdict {
                free: false,
                written: false,
            });
        }

        info!(user_id, %address, written, "Address claimed");
        Ok(Verdict {
            free: true,
            written,
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use guardmesh_crypto::ChallengeSigner;

    use super::*;
    use crate::claim::nonce::MAX_NONCE_TTL;
    use crate::storage::NewUser;

    async fn setup(ttl: Duration) -> (ClaimHandler, RegistryDatabase) {
        let db = RegistryDatabase::open_in_memory().await.unwrap();
        (ClaimHandler::new(db.clone(), NonceStore::new(ttl)), db)
    }

    async fn register(db: &RegistryDatabase, name: &str, latest_ip: &str) -> (i64, ChallengeSigner) {
        let signer = ChallengeSigner::generate();
        let id = db
            .add_user(&NewUser {
                username: name,
                display_name: name,
                public_key: &signer.public_key().to_base64(),
                latest_ip,
            })
            .await
            .unwrap();
        (id, signer)
    }

    fn request(user_id: i64, ip: &str, sig: Option<String>) -> ClaimRequest {
        ClaimRequest {
            user_id,
            ip_address: ip.to_string(),
            sig,
        }
    }

    /// Run both phases and return the verdict.
    async fn claim(
        handler: &ClaimHandler,
        user_id: i64,
        signer: &ChallengeSigner,
        ip: &str,
    ) -> Result<Verdict, ClaimError> {
        let ClaimResponse::Challenge(ch) = handler.handle(request(user_id, ip, None)).await? else {
            panic!("expected a challenge");
        };
        let nonce = hex::decode(&ch.nonce).unwrap();
        let sig = BASE64.encode(signer.sign(&nonce));
        match handler.handle(request(user_id, ip, Some(sig))).await? {
            ClaimResponse::Verdict(v) => Ok(v),
            ClaimResponse::Challenge(_) => panic!("expected a verdict"),
        }
    }

    #[tokio::test]
    async fn happy_path_then_second_user_is_refused() {
        let (handler, db) = setup(MAX_NONCE_TTL).await;
        let (alice, alice_key) = register(&db, "alice", "").await;
        let (bob, bob_key) = register(&db, "bob", "").await;

        let v = claim(&handler, alice, &alice_key, "10.1.0.20").await.unwrap();
        assert_eq!(v, Verdict { free: true, written: true });
        assert_eq!(db.lookup_user_by_address("10.1.0.20".parse().unwrap()).await.unwrap(), alice);

        let v = claim(&handler, bob, &bob_key, "10.1.0.20").await.unwrap();
        assert_eq!(v, Verdict { free: false, written: false });
        assert_eq!(db.lookup_user_by_address("10.1.0.20".parse().unwrap()).await.unwrap(), alice);
    }

    #[tokio::test]
    async fn reconfirming_own_address_is_free_but_unwritten() {
        let (handler, db) = setup(MAX_NONCE_TTL).await;
        let (alice, key) = register(&db, "alice", "10.1.0.20").await;
        let v = claim(&handler, alice, &key, "10.1.0.20").await.unwrap();
        assert_eq!(v, Verdict { free: true, written: false });
    }

    #[tokio::test]
    async fn nonce_cannot_be_verified_twice() {
        let (handler, db) = setup(MAX_NONCE_TTL).await;
        let (alice, key) = register(&db, "alice", "").await;

        let ClaimResponse::Challenge(ch) =
            handler.handle(request(alice, "10.1.0.20", None)).await.unwrap()
        else {
            panic!("expected a challenge");
        };
        let sig = BASE64.encode(key.sign(&hex::decode(&ch.nonce).unwrap()));

        handler
            .handle(request(alice, "10.1.0.20", Some(sig.clone())))
            .await
            .unwrap();
        let err = handler
            .handle(request(alice, "10.1.0.20", Some(sig)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::NoActiveChallenge));
    }

    #[tokio::test]
    async fn failed_verification_still_consumes_nonce() {
        let (handler, db) = setup(MAX_NONCE_TTL).await;
        let (alice, _) = register(&db, "alice", "").await;
        let mallory = ChallengeSigner::generate();

        let ClaimResponse::Challenge(ch) =
            handler.handle(request(alice, "10.1.0.20", None)).await.unwrap()
        else {
            panic!("expected a challenge");
        };
        let forged = BASE64.encode(mallory.sign(&hex::decode(&ch.nonce).unwrap()));

        let err = handler
            .handle(request(alice, "10.1.0.20", Some(forged.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::Rejected));
        let err = handler
            .handle(request(alice, "10.1.0.20", Some(forged)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::NoActiveChallenge));
        assert!(db.lookup_user_by_address("10.1.0.20".parse().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn expired_nonce_fails_even_with_valid_signature() {
        let ttl = Duration::from_millis(40);
        let (handler, db) = setup(ttl).await;
        let (alice, key) = register(&db, "alice", "").await;

        let ClaimResponse::Challenge(ch) =
            handler.handle(request(alice, "10.1.0.20", None)).await.unwrap()
        else {
            panic!("expected a challenge");
        };
        let sig = BASE64.encode(key.sign(&hex::decode(&ch.nonce).unwrap()));
        tokio::time::sleep(ttl * 2).await;

        let err = handler
            .handle(request(alice, "10.1.0.20", Some(sig)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::Expired));
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[tokio::test]
    async fn unknown_user_and_bad_signature_look_alike() {
        let (handler, db) = setup(MAX_NONCE_TTL).await;
        let (alice, _) = register(&db, "alice", "").await;
        let stranger = ChallengeSigner::generate();

        let unknown = claim(&handler, alice + 100, &stranger, "10.1.0.20")
            .await
            .unwrap_err();
        let forged = claim(&handler, alice, &stranger, "10.1.0.20")
            .await
            .unwrap_err();
        assert_eq!(unknown.to_string(), forged.to_string());
        assert!(matches!(unknown, ClaimError::Rejected));
    }

    #[tokio::test]
    async fn malformed_input_is_rejected_without_side_effects() {
        let (handler, db) = setup(MAX_NONCE_TTL).await;
        let (alice, _) = register(&db, "alice", "").await;

        let err = handler
            .handle(request(alice, "10.1.0", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::Validation(ref v) if v.field == Field::Address));
        assert!(handler.nonces().is_empty().await);

        handler.handle(request(alice, "10.1.0.20", None)).await.unwrap();
        let err = handler
            .handle(request(alice, "10.1.0.20", Some("***".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::Validation(ref v) if v.field == Field::Signature));
        assert!(db.lookup_user_by_address("10.1.0.20".parse().unwrap()).await.is_err());
    }

    #[test]
    fn responses_serialize_flat() {
        let ch = ClaimResponse::Challenge(Challenge { nonce: "ab".into() });
        assert_eq!(serde_json::to_string(&ch).unwrap(), r#"{"nonce":"ab"}"#);
        let v = ClaimResponse::Verdict(Verdict { free: true, written: false });
        assert_eq!(
            serde_json::to_string(&v).unwrap(),
            r#"{"free":true,"written":false}"#
        );
    }
}
