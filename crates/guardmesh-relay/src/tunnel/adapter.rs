//! Ownership of the node's single tunnel interface.

use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use guardmesh_core::config::{check_mtu, check_role_address};
use guardmesh_core::net::{host_net, mesh_block};
use guardmesh_core::NodeRole;
use guardmesh_crypto::{KeyPair, WgKey};
use ipnet::IpNet;
use tracing::{debug, info, warn};

use super::device::{DeviceConfig, DeviceProvider, PeerConfig, TunnelDevice};
use super::error::TunnelError;
use super::link::LinkOps;

/// Deadline for a single device or link operation.
pub const DEVICE_TIMEOUT: Duration = Duration::from_secs(5);

async fn bounded<T, F>(op: &'static str, fut: F) -> Result<T, TunnelError>
where
    F: Future<Output = Result<T, TunnelError>>,
{
    tokio::time::timeout(DEVICE_TIMEOUT, fut)
        .await
        .map_err(|_| TunnelError::Timeout {
            op,
            deadline: DEVICE_TIMEOUT,
        })?
}

/// Handle to the tunnel interface. Only the owning task holds one.
pub struct TunnelAdapter {
    device: Box<dyn TunnelDevice>,
    link: Box<dyn LinkOps>,
    public_key: WgKey,
    listen_port: u16,
    closed: AtomicBool,
}

impl std::fmt::Debug for TunnelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAdapter")
            .field("name", &self.device.name())
            .field("public_key", &self.public_key)
            .field("listen_port", &self.listen_port)
            .finish_non_exhaustive()
    }
}

impl TunnelAdapter {
    /// Create the interface and load its private key and listen port.
    ///
    /// A fresh key pair is generated when `private_key` is `None`.
    pub async fn create_interface(
        provider: &dyn DeviceProvider,
        link: Box<dyn LinkOps>,
        name: &str,
        private_key: Option<WgKey>,
        listen_port: u16,
    ) -> Result<Self, TunnelError> {
        let keys = match private_key {
            Some(key) => KeyPair::from_private(key),
            None => {
                info!(iface = name, "No private key configured, generating one");
                KeyPair::generate()
            }
        };

        let device = bounded("create_interface", provider.create(name)).await?;
        let config = DeviceConfig {
            private_key: Some(*keys.private_key()),
            listen_port: Some(listen_port),
            ..DeviceConfig::default()
        };
        if let Err(e) = bounded("configure", device.configure(&config)).await {
            let _ = device.close().await;
            return Err(e);
        }

        info!(iface = name, public_key = %keys.public_key(), listen_port, "Tunnel interface created");
        Ok(Self {
            device,
            link,
            public_key: *keys.public_key(),
            listen_port,
            closed: AtomicBool::new(false),
        })
    }

    /// Take over an interface that is already configured, e.g. for a
    /// one-off synchronization pass against a running node.
    pub async fn attach(
        device: Box<dyn TunnelDevice>,
        link: Box<dyn LinkOps>,
    ) -> Result<Self, TunnelError> {
        let state = bounded("read_state", device.state()).await?;
        let private_key = state.private_key.ok_or_else(|| {
            TunnelError::Device(format!("interface {} has no private key", device.name()))
        })?;
        debug!(iface = device.name(), "Attached to running interface");
        Ok(Self {
            public_key: private_key.public_key(),
            listen_port: state.listen_port,
            device,
            link,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub const fn public_key(&self) -> &WgKey {
        &self.public_key
    }

    pub const fn listen_port(&self) -> u16 {
        self.listen_port
    }

    fn ensure_open(&self) -> Result<(), TunnelError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TunnelError::Closed(self.name().to_string()))
        } else {
            Ok(())
        }
    }

    /// Assign the node's address, set the MTU, bring the link up and route
    /// the whole mesh block through the interface.
    ///
    /// Servers must use the relay host address (`.1` / `::1`). An `mtu` of 0
    /// selects the default.
    pub async fn assign_address(
        &self,
        role: NodeRole,
        address: IpAddr,
        mtu: u32,
    ) -> Result<(), TunnelError> {
        self.ensure_open()?;
        check_role_address(role, address)?;
        let mtu = check_mtu(mtu)?;
        let iface = self.name();

        bounded("add_address", self.link.add_address(iface, host_net(address))).await?;
        bounded("set_mtu", self.link.set_mtu(iface, mtu)).await?;
        bounded("set_up", self.link.set_up(iface)).await?;
        bounded(
            "add_route",
            self.link.add_route(iface, IpNet::V4(mesh_block())),
        )
        .await?;

        info!(iface, %address, mtu, ?role, "Tunnel address assigned");
        Ok(())
    }

    /// Replace the whole peer table with `peers`.
    ///
    /// The interface's private key, listen port and firewall mark are read
    /// back and re-sent unchanged.
    pub async fn apply_peers(&self, peers: Vec<PeerConfig>) -> Result<(), TunnelError> {
        self.ensure_open()?;
        let current = bounded("read_state", self.device.state()).await?;

        let peers = peers
            .into_iter()
            .map(|mut p| {
                p.replace_allowed_ips = true;
                p
            })
            .collect::<Vec<_>>();
        let count = peers.len();

        let config = DeviceConfig {
            private_key: current.private_key,
            listen_port: Some(current.listen_port),
            fwmark: Some(current.fwmark),
            replace_peers: true,
            peers,
        };
        bounded("apply_peers", self.device.configure(&config)).await?;

        debug!(iface = self.name(), peers = count, "Peer table replaced");
        Ok(())
    }

    /// Current peer table as reported by the device.
    pub async fn peers(&self) -> Result<Vec<PeerConfig>, TunnelError> {
        self.ensure_open()?;
        Ok(bounded("read_state", self.device.state()).await?.peers)
    }

    /// The interface's own tunnel address, read from the live link.
    /// IPv4 is preferred over IPv6.
    pub async fn local_address(&self) -> Result<IpAddr, TunnelError> {
        self.ensure_open()?;
        let addrs = bounded("read_addresses", self.link.addresses(self.name())).await?;
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.iter().find(|a| !a.is_loopback()))
            .copied()
            .ok_or_else(|| {
                TunnelError::Link(format!("interface {} has no address", self.name()))
            })
    }

    /// Release the device. Only the first call reaches it.
    pub async fn close(&self) -> Result<(), TunnelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = bounded("close", self.device.close()).await {
            warn!(iface = self.name(), error = %e, "Tunnel close failed");
            return Err(e);
        }
        info!(iface = self.name(), "Tunnel interface closed");
        Ok(())
    }
}
