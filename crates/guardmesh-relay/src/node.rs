//! Node wiring: the tunnel task, the control API task and the nonce sweeper
//! run under one [`Supervisor`].
//!
//! The tunnel task creates the interface, assigns its address and runs peer
//! synchronization, then re-runs it every `sync.interval`. Any failure of the
//! first pass ends the task and with it the node. A registry failure in a
//! later pass is retried with exponential backoff up to
//! [`RetryPolicy::max_attempts`] times before it too is fatal. Device
//! failures are fatal at any point.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use guardmesh_core::{NodeConfig, NodeRole};
use guardmesh_crypto::WgKey;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::claim::{ClaimHandler, NonceStore};
use crate::server::{self, AppState, build_router};
use crate::storage::RegistryDatabase;
use crate::supervisor::{Supervisor, SupervisorError, TaskError};
use crate::sync::{SyncError, Synchronizer};
use crate::tunnel::{DEVICE_TIMEOUT, DeviceProvider, LinkOps, TunnelAdapter, TunnelError};

/// How often expired claim challenges are swept.
pub const NONCE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Failed to bind control API on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Consecutive failed passes tolerated after a successful start.
pub const SYNC_RETRY_LIMIT: u32 = 5;

/// Exponential backoff for failed synchronization passes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Start at one second, doubling up to `max_delay`, for at most
    /// [`SYNC_RETRY_LIMIT`] retries.
    pub fn capped_at(max_delay: Duration) -> Self {
        Self {
            initial_delay: Duration::from_secs(1).min(max_delay),
            max_delay,
            max_attempts: SYNC_RETRY_LIMIT,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Everything the tunnel task owns.
struct TunnelTask {
    provider: Box<dyn DeviceProvider>,
    link: Box<dyn LinkOps>,
    interface: String,
    private_key: Option<WgKey>,
    listen_port: u16,
    role: NodeRole,
    address: IpAddr,
    mtu: u32,
    sync_interval: Duration,
    synchronizer: Option<Synchronizer>,
}

impl TunnelTask {
    async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), NodeError> {
        let tunnel = TunnelAdapter::create_interface(
            self.provider.as_ref(),
            self.link,
            &self.interface,
            self.private_key,
            self.listen_port,
        )
        .await?;

        let result = drive(
            &tunnel,
            self.role,
            self.address,
            self.mtu,
            self.synchronizer.as_ref(),
            self.sync_interval,
            &mut shutdown,
        )
        .await;
        let closed = tunnel.close().await;
        result?;
        closed?;
        Ok(())
    }
}

async fn drive(
    tunnel: &TunnelAdapter,
    role: NodeRole,
    address: IpAddr,
    mtu: u32,
    synchronizer: Option<&Synchronizer>,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), NodeError> {
    tunnel.assign_address(role, address, mtu).await?;

    let Some(synchronizer) = synchronizer else {
        let _ = shutdown.changed().await;
        info!("Tunnel task shutting down");
        return Ok(());
    };

    let report = synchronizer.sync(tunnel).await?;
    info!(relays = report.relays, users = report.users, "Initial peer synchronization done");

    let retry = RetryPolicy::capped_at(interval);
    let mut attempt: u32 = 0;
    let mut delay = interval;
    loop {
        if *shutdown.borrow() {
            info!("Tunnel task shutting down");
            return Ok(());
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                info!("Tunnel task shutting down");
                return Ok(());
            }
        }

        match synchronizer.sync(tunnel).await {
            Ok(_) => {
                attempt = 0;
                delay = interval;
            }
            Err(e @ SyncError::Tunnel(_)) => return Err(e.into()),
            Err(e) if attempt >= retry.max_attempts => {
                error!(error = %e, attempts = attempt, "Peer synchronization keeps failing, giving up");
                return Err(e.into());
            }
            Err(e) => {
                delay = retry.delay_for_attempt(attempt);
                warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Peer synchronization failed, retrying");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

async fn run_control_api(
    bind: SocketAddr,
    tls: Arc<ServerConfig>,
    state: AppState,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
) -> Result<(), NodeError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|source| NodeError::Bind { addr: bind, source })?;
    server::serve(
        listener,
        TlsAcceptor::from(tls),
        build_router(state),
        shutdown,
        grace,
    )
    .await;
    Ok(())
}

/// A configured node, ready to run.
pub struct Node {
    config: NodeConfig,
    address: IpAddr,
    private_key: Option<WgKey>,
    db: Option<RegistryDatabase>,
    provider: Box<dyn DeviceProvider>,
    link: Box<dyn LinkOps>,
    tls: Option<Arc<ServerConfig>>,
}

impl Node {
    /// Check the pieces fit together. Servers need the registry and TLS
    /// material; clients run the tunnel only and need neither.
    pub fn new(
        config: NodeConfig,
        db: Option<RegistryDatabase>,
        provider: Box<dyn DeviceProvider>,
        link: Box<dyn LinkOps>,
        tls: Option<Arc<ServerConfig>>,
    ) -> Result<Self, NodeError> {
        let address = config
            .tunnel
            .address
            .ok_or_else(|| NodeError::Config("tunnel.address is required".into()))?;
        let private_key = config
            .tunnel
            .private_key
            .as_deref()
            .map(WgKey::from_base64)
            .transpose()
            .map_err(|e| NodeError::Config(format!("tunnel.private_key: {e}")))?;
        if config.role == NodeRole::Server {
            if db.is_none() {
                return Err(NodeError::Config("server role requires the registry".into()));
            }
            if tls.is_none() {
                return Err(NodeError::Config(
                    "server role requires control API certificates".into(),
                ));
            }
        }

        Ok(Self {
            config,
            address,
            private_key,
            db,
            provider,
            link,
            tls,
        })
    }

    /// Run every task until `stop` resolves or one of them fails.
    pub async fn run(self, stop: impl Future<Output = ()>) -> Result<(), SupervisorError> {
        let Self {
            config,
            address,
            private_key,
            db,
            provider,
            link,
            tls,
        } = self;
        let mut group = Supervisor::new();
        let services = match (db, tls) {
            (Some(db), Some(tls)) if config.role == NodeRole::Server => Some((db, tls)),
            _ => None,
        };

        let tunnel = TunnelTask {
            provider,
            link,
            interface: config.tunnel.interface.clone(),
            private_key,
            listen_port: config.tunnel.listen_port,
            role: config.role,
            address,
            mtu: config.tunnel.mtu,
            sync_interval: config.sync.interval(),
            synchronizer: services
                .as_ref()
                .map(|(db, _)| Synchronizer::new(db.clone())),
        };
        let rx = group.subscribe();
        group.spawn("tunnel", async move {
            tunnel.run(rx).await.map_err(TaskError::from)
        });

        if let Some((db, tls)) = services {
            let nonces = NonceStore::new(config.claim.nonce_ttl());
            let state = AppState {
                claims: ClaimHandler::new(db.clone(), nonces.clone()),
                db,
            };

            let rx = group.subscribe();
            group.spawn("nonce-sweeper", async move {
                nonces.run_sweeper(NONCE_SWEEP_INTERVAL, rx).await;
                Ok(())
            });

            let rx = group.subscribe();
            let bind = config.control.bind;
            let grace = config.control.shutdown_grace();
            group.spawn("control-api", async move {
                run_control_api(bind, tls, state, rx, grace)
                    .await
                    .map_err(TaskError::from)
            });
        }

        info!(
            role = ?config.role,
            iface = %config.tunnel.interface,
            %address,
            "Node running"
        );
        let unwind = config.control.shutdown_grace() + DEVICE_TIMEOUT;
        group.run(stop, unwind).await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use guardmesh_crypto::KeyPair;

    use super::*;
    use crate::storage::NewServer;
    use crate::tls::{generate_dev_bundle, server_config_from_pem};
    use crate::tunnel::{MemoryLink, MemoryProvider, TunnelDevice};

    fn server_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.tunnel.address = Some("10.1.0.1".parse().unwrap());
        config.control.bind = "127.0.0.1:0".parse().unwrap();
        config.control.shutdown_grace_secs = 1;
        config
    }

    fn tls() -> Arc<ServerConfig> {
        let bundle = generate_dev_bundle(&["localhost"], "admin").unwrap();
        server_config_from_pem(
            bundle.ca_cert_pem.as_bytes(),
            bundle.node_cert_pem.as_bytes(),
            bundle.node_key_pem.as_bytes(),
        )
        .unwrap()
    }

    async fn registry_with_peer() -> RegistryDatabase {
        let db = RegistryDatabase::open_in_memory().await.unwrap();
        let key = KeyPair::generate().public_key().to_base64();
        let psk = WgKey::generate_preshared().to_base64();
        db.add_server(&NewServer {
            name: "peer",
            public_ip: "203.0.113.20",
            port: 51820,
            private_ip: "10.2.0.1",
            public_key: &key,
            preshared_key: &psk,
        })
        .await
        .unwrap();
        db
    }

    struct FailingProvider;

    #[async_trait]
    impl DeviceProvider for FailingProvider {
        async fn create(&self, name: &str) -> Result<Box<dyn TunnelDevice>, TunnelError> {
            Err(TunnelError::Device(format!("cannot create {name}")))
        }
    }

    #[test]
    fn retry_delays_double_and_cap() {
        let policy = RetryPolicy::capped_at(Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn retries_are_bounded() {
        let policy = RetryPolicy::capped_at(Duration::from_secs(60));
        assert_eq!(policy.max_attempts, SYNC_RETRY_LIMIT);
    }

    #[test]
    fn short_interval_caps_first_retry() {
        let policy = RetryPolicy::capped_at(Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn missing_address_is_a_config_error() {
        let mut config = server_config();
        config.tunnel.address = None;
        let db = RegistryDatabase::open_in_memory().await.unwrap();
        let err = Node::new(
            config,
            Some(db),
            Box::new(MemoryProvider::default()),
            Box::new(MemoryLink::default()),
            Some(tls()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn server_requires_tls() {
        let db = RegistryDatabase::open_in_memory().await.unwrap();
        let err = Node::new(
            server_config(),
            Some(db),
            Box::new(MemoryProvider::default()),
            Box::new(MemoryLink::default()),
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn server_requires_registry() {
        let err = Node::new(
            server_config(),
            None,
            Box::new(MemoryProvider::default()),
            Box::new(MemoryLink::default()),
            Some(tls()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn server_syncs_peers_and_releases_interface_on_stop() {
        let provider = MemoryProvider::default();
        let link = MemoryLink::default();
        let node = Node::new(
            server_config(),
            Some(registry_with_peer().await),
            Box::new(provider.clone()),
            Box::new(link.clone()),
            Some(tls()),
        )
        .unwrap();

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let running = tokio::spawn(node.run(async move {
            let _ = stop_rx.changed().await;
        }));

        let mut peers = Vec::new();
        for _ in 0..100 {
            if let Some(device) = provider.device("wg0").await {
                peers = device.state().await.unwrap().peers;
                if !peers.is_empty() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].endpoint, Some("203.0.113.20:51820".parse().unwrap()));
        assert!(link.is_up("wg0").await);

        stop_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
        assert!(provider.device("wg0").await.unwrap().is_closed().await);
    }

    #[tokio::test]
    async fn device_failure_stops_the_node() {
        let db = RegistryDatabase::open_in_memory().await.unwrap();
        let node = Node::new(
            server_config(),
            Some(db),
            Box::new(FailingProvider),
            Box::new(MemoryLink::default()),
            Some(tls()),
        )
        .unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            node.run(std::future::pending::<()>()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, SupervisorError::Task { task: "tunnel", .. }));
    }

    #[tokio::test]
    async fn client_runs_tunnel_only() {
        let mut config = NodeConfig::default();
        config.role = NodeRole::Client;
        config.tunnel.address = Some("10.1.0.42".parse().unwrap());
        let provider = MemoryProvider::default();
        let link = MemoryLink::default();
        let node = Node::new(
            config,
            None,
            Box::new(provider.clone()),
            Box::new(link.clone()),
            None,
        )
        .unwrap();

        node.run(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        })
        .await
        .unwrap();
        let device = provider.device("wg0").await.unwrap();
        assert!(device.state().await.unwrap().peers.is_empty());
        assert!(device.is_closed().await);
    }

    #[tokio::test]
    async fn registry_failure_at_startup_stops_the_node() {
        let db = registry_with_peer().await;
        db.pool().close().await;
        let provider = MemoryProvider::default();
        let node = Node::new(
            server_config(),
            Some(db),
            Box::new(provider.clone()),
            Box::new(MemoryLink::default()),
            Some(tls()),
        )
        .unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            node.run(std::future::pending::<()>()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, SupervisorError::Task { task: "tunnel", .. }));
        assert!(provider.device("wg0").await.unwrap().is_closed().await);
    }

    #[tokio::test]
    async fn persistent_registry_failure_ends_resync_loop() {
        let db = registry_with_peer().await;
        let tunnel = TunnelAdapter::create_interface(
            &MemoryProvider::default(),
            Box::new(MemoryLink::default()),
            "wg0",
            None,
            51820,
        )
        .await
        .unwrap();
        let synchronizer = Synchronizer::new(db.clone());
        let (_stop, mut shutdown) = watch::channel(false);

        let outage = async {
            while tunnel.peers().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            db.pool().close().await;
        };
        let driven = drive(
            &tunnel,
            NodeRole::Server,
            "10.1.0.1".parse().unwrap(),
            0,
            Some(&synchronizer),
            Duration::from_millis(20),
            &mut shutdown,
        );
        let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(driven, outage)
        })
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert!(matches!(err, NodeError::Sync(SyncError::Registry(_))));
    }
}
