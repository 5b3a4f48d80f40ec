//! Single-use claim challenges keyed by user id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 32;

/// Upper bound on a challenge's lifetime.
pub const MAX_NONCE_TTL: Duration = Duration::from_secs(30);

pub type Nonce = [u8; NONCE_LEN];

#[derive(Debug, Clone, Copy)]
struct NonceEntry {
    nonce: Nonce,
    expires_at: Instant,
}

/// Result of consuming a challenge. The entry is gone in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    Live(Nonce),
    Expired,
    Missing,
}

/// In-memory challenge table shared by request handlers and the sweeper.
#[derive(Debug, Clone)]
pub struct NonceStore {
    entries: Arc<Mutex<HashMap<i64, NonceEntry>>>,
    ttl: Duration,
}

impl NonceStore {
    /// Create a store; `ttl` is capped at [`MAX_NONCE_TTL`].
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::default(),
            ttl: ttl.min(MAX_NONCE_TTL),
        }
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh challenge for `user_id`, replacing any outstanding one.
    pub async fn issue(&self, user_id: i64) -> Nonce {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let entry = NonceEntry {
            nonce,
            expires_at: Instant::now() + self.ttl,
        };
        if self.entries.lock().await.insert(user_id, entry).is_some() {
            debug!(user_id, "Replaced outstanding challenge");
        }
        nonce
    }

    /// Remove and return the challenge for `user_id`.
    pub async fn consume(&self, user_id: i64) -> Consumed {
        let Some(entry) = self.entries.lock().await.remove(&user_id) else {
            return Consumed::Missing;
        };
        if Instant::now() < entry.expires_at {
            Consumed::Live(entry.nonce)
        } else {
            Consumed::Expired
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sweep every `interval` until `shutdown` flips.
    pub async fn run_sweeper(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let removed = self.sweep().await;
                    if removed > 0 {
                        debug!(removed, "Expired challenges swept");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Nonce sweeper shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(40);

    #[tokio::test]
    async fn nonce_is_single_use() {
        let store = NonceStore::new(MAX_NONCE_TTL);
        let nonce = store.issue(7).await;
        assert_eq!(store.consume(7).await, Consumed::Live(nonce));
        assert_eq!(store.consume(7).await, Consumed::Missing);
    }

    #[tokio::test]
    async fn expired_nonce_is_reported_and_removed() {
        let store = NonceStore::new(SHORT);
        store.issue(7).await;
        tokio::time::sleep(SHORT * 2).await;
        assert_eq!(store.consume(7).await, Consumed::Expired);
        assert_eq!(store.consume(7).await, Consumed::Missing);
    }

    #[tokio::test]
    async fn reissue_replaces_previous_nonce() {
        let store = NonceStore::new(MAX_NONCE_TTL);
        let first = store.issue(7).await;
        let second = store.issue(7).await;
        assert_ne!(first, second);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.consume(7).await, Consumed::Live(second));
    }

    #[tokio::test]
    async fn ttl_is_capped() {
        let store = NonceStore::new(Duration::from_secs(300));
        assert_eq!(store.ttl(), MAX_NONCE_TTL);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired() {
        let short = NonceStore::new(SHORT);
        short.issue(1).await;
        let long = NonceStore {
            entries: Arc::clone(&short.entries),
            ttl: MAX_NONCE_TTL,
        };
        long.issue(2).await;

        tokio::time::sleep(SHORT * 2).await;
        assert_eq!(short.sweep().await, 1);
        assert_eq!(short.len().await, 1);
        assert!(matches!(short.consume(2).await, Consumed::Live(_)));
    }

    #[tokio::test]
    async fn sweeper_runs_and_stops() {
        let store = NonceStore::new(SHORT);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(store.clone().run_sweeper(SHORT, rx));

        store.issue(1).await;
        tokio::time::sleep(SHORT * 4).await;
        assert!(store.is_empty().await);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
