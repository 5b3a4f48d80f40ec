//! Peer synchronization: derive this node's peer set from the registry and
//! push it to the tunnel.
//!
//! The local address is read from the live interface, never from config.
//! Relays peer with every other relay (endpoint, pre-shared key) and with the
//! users whose latest address falls in their own /24 (/64 on IPv6). A
//! malformed or undecodable row is logged and skipped; a failed query
//! aborts the pass.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use guardmesh_core::ErrorKind;
use guardmesh_core::net::{host_net, user_scope};
use guardmesh_crypto::WgKey;
use tracing::{debug, info, warn};

use crate::storage::{RegistryDatabase, RegistryError, RelayServer};
use crate::tunnel::{PeerConfig, TunnelAdapter, TunnelError};

/// Keepalive for every peer the synchronizer installs.
pub const PERSISTENT_KEEPALIVE: Duration = Duration::from_secs(25);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Registry read failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("Tunnel update failed: {0}")]
    Tunnel(#[from] TunnelError),
}

impl SyncError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Registry(e) => e.kind(),
            Self::Tunnel(e) => e.kind(),
        }
    }
}

/// How a derived peer set reaches the tunnel.
#[async_trait]
pub trait PeerApplyStrategy: Send + Sync {
    async fn apply(&self, tunnel: &TunnelAdapter, peers: Vec<PeerConfig>)
    -> Result<(), TunnelError>;
}

/// Replace the whole peer table on every pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceAll;

#[async_trait]
impl PeerApplyStrategy for ReplaceAll {
    async fn apply(
        &self,
        tunnel: &TunnelAdapter,
        peers: Vec<PeerConfig>,
    ) -> Result<(), TunnelError> {
        tunnel.apply_peers(peers).await
    }
}

/// Counts from one synchronization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub relays: usize,
    pub users: usize,
    pub skipped: usize,
}

pub struct Synchronizer {
    db: RegistryDatabase,
    strategy: Box<dyn PeerApplyStrategy>,
}

impl Synchronizer {
    pub fn new(db: RegistryDatabase) -> Self {
        Self::with_strategy(db, Box::new(ReplaceAll))
    }

    pub fn with_strategy(db: RegistryDatabase, strategy: Box<dyn PeerApplyStrategy>) -> Self {
        Self { db, strategy }
    }

    /// Run one pass against `tunnel`.
    pub async fn sync(&self, tunnel: &TunnelAdapter) -> Result<SyncReport, SyncError> {
        let local = tunnel.local_address().await?;
        let (peers, report) = self.desired_peers(local).await?;
        self.strategy.apply(tunnel, peers).await?;
        info!(
            %local,
            relays = report.relays,
            users = report.users,
            skipped = report.skipped,
            "Peer table synchronized"
        );
        Ok(report)
    }

    /// The peer set a node at `local` should have.
    pub async fn desired_peers(
        &self,
        local: IpAddr,
    ) -> Result<(Vec<PeerConfig>, SyncReport), RegistryError> {
        let mut report = SyncReport::default();
        let mut peers = Vec::new();

        for row in self.db.servers_except(local).await? {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(server_id = ?e.id, error = %e, "Skipping undecodable relay server row");
                    report.skipped += 1;
                    continue;
                }
            };
            let server = match RelayServer::try_from(&row) {
                Ok(server) => server,
                Err(e) => {
                    warn!(server_id = row.id, error = %e, "Skipping malformed relay server row");
                    report.skipped += 1;
                    continue;
                }
            };
            if server.private_ip == local {
                debug!(server_id = row.id, "Skipping own relay row");
                continue;
            }
            peers.push(PeerConfig {
                public_key: server.public_key,
                preshared_key: Some(server.preshared_key),
                endpoint: Some(SocketAddr::new(server.public_ip, server.port)),
                allowed_ips: vec![host_net(server.private_ip)],
                persistent_keepalive: Some(PERSISTENT_KEEPALIVE),
                replace_allowed_ips: true,
            });
            report.relays += 1;
        }

        let scope = user_scope(local);
        for row in self.db.users_in_scope(scope).await? {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(user_id = ?e.id, error = %e, "Skipping undecodable user row");
                    report.skipped += 1;
                    continue;
                }
            };
            let address = match row.latest_address() {
                Some(Ok(address)) => address,
                Some(Err(e)) => {
                    warn!(user_id = row.id, error = %e, "Skipping user row with malformed address");
                    report.skipped += 1;
                    continue;
                }
                None => continue,
            };
            if !scope.contains(&address) {
                continue;
            }
            if address == local {
                warn!(user_id = row.id, %address, "Skipping user row holding the relay address");
                report.skipped += 1;
                continue;
            }
            let public_key = match WgKey::from_slice(&row.public_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!(user_id = row.id, error = %e, "Skipping user row with malformed key");
                    report.skipped += 1;
                    continue;
                }
            };
            peers.push(PeerConfig {
                public_key,
                preshared_key: None,
                endpoint: None,
                allowed_ips: vec![host_net(address)],
                persistent_keepalive: Some(PERSISTENT_KEEPALIVE),
                replace_allowed_ips: true,
            });
            report.users += 1;
        }

        Ok((peers, report))
    }
}
