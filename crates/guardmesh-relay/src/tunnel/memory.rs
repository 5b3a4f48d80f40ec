//! In-process tunnel device and link, for tests and dry runs.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::Mutex;

use super::device::{DeviceConfig, DeviceProvider, DeviceState, TunnelDevice};
use super::error::TunnelError;
use super::link::LinkOps;

#[derive(Debug, Default)]
struct Inner {
    state: DeviceState,
    closed: bool,
}

/// A device that applies configuration to an in-memory peer table with the
/// same replace/merge rules as a real WireGuard implementation.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    name: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::default(),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }
}

#[async_trait]
impl TunnelDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&self, config: &DeviceConfig) -> Result<(), TunnelError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(TunnelError::Closed(self.name.clone()));
        }
        let state = &mut inner.state;
        if let Some(key) = config.private_key {
            state.private_key = Some(key);
        }
        if let Some(port) = config.listen_port {
            state.listen_port = port;
        }
        if let Some(mark) = config.fwmark {
            state.fwmark = mark;
        }
        if config.replace_peers {
            state.peers.clear();
        }
        for update in &config.peers {
            let existing = state
                .peers
                .iter_mut()
                .find(|p| p.public_key == update.public_key);
            match existing {
                Some(peer) => {
                    if update.preshared_key.is_some() {
                        peer.preshared_key = update.preshared_key;
                    }
                    if update.endpoint.is_some() {
                        peer.endpoint = update.endpoint;
                    }
                    if update.persistent_keepalive.is_some() {
                        peer.persistent_keepalive = update.persistent_keepalive;
                    }
                    if update.replace_allowed_ips {
                        peer.allowed_ips.clear();
                    }
                    for net in &update.allowed_ips {
                        if !peer.allowed_ips.contains(net) {
                            peer.allowed_ips.push(*net);
                        }
                    }
                }
                None => {
                    let mut peer = update.clone();
                    peer.replace_allowed_ips = false;
                    state.peers.push(peer);
                }
            }
        }
        Ok(())
    }

    async fn state(&self) -> Result<DeviceState, TunnelError> {
        let inner = self.inner.lock().await;
        if inner.closed {
            return Err(TunnelError::Closed(self.name.clone()));
        }
        Ok(inner.state.clone())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.inner.lock().await.closed = true;
        Ok(())
    }
}

/// Hands out [`MemoryDevice`]s and keeps a handle to each for inspection.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    devices: Arc<Mutex<HashMap<String, MemoryDevice>>>,
}

impl MemoryProvider {
    pub async fn device(&self, name: &str) -> Option<MemoryDevice> {
        self.devices.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl DeviceProvider for MemoryProvider {
    async fn create(&self, name: &str) -> Result<Box<dyn TunnelDevice>, TunnelError> {
        let device = MemoryDevice::new(name);
        self.devices
            .lock()
            .await
            .insert(name.to_string(), device.clone());
        Ok(Box::new(device))
    }
}

#[derive(Debug, Default)]
struct LinkState {
    addresses: Vec<IpNet>,
    mtu: Option<u32>,
    up: bool,
    routes: BTreeSet<IpNet>,
}

/// Link operations recorded in memory, keyed by interface name.
#[derive(Debug, Clone, Default)]
pub struct MemoryLink {
    links: Arc<Mutex<HashMap<String, LinkState>>>,
}

impl MemoryLink {
    pub async fn is_up(&self, iface: &str) -> bool {
        self.links.lock().await.get(iface).is_some_and(|l| l.up)
    }

    pub async fn mtu(&self, iface: &str) -> Option<u32> {
        self.links.lock().await.get(iface).and_then(|l| l.mtu)
    }

    pub async fn routes(&self, iface: &str) -> Vec<IpNet> {
        self.links
            .lock()
            .await
            .get(iface)
            .map(|l| l.routes.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LinkOps for MemoryLink {
    async fn add_address(&self, iface: &str, addr: IpNet) -> Result<(), TunnelError> {
        let mut links = self.links.lock().await;
        let link = links.entry(iface.to_string()).or_default();
        if link.addresses.contains(&addr) {
            return Err(TunnelError::Link(format!("{addr} already assigned to {iface}")));
        }
        link.addresses.push(addr);
        Ok(())
    }

    async fn set_mtu(&self, iface: &str, mtu: u32) -> Result<(), TunnelError> {
        self.links
            .lock()
            .await
            .entry(iface.to_string())
            .or_default()
            .mtu = Some(mtu);
        Ok(())
    }

    async fn set_up(&self, iface: &str) -> Result<(), TunnelError> {
        self.links
            .lock()
            .await
            .entry(iface.to_string())
            .or_default()
            .up = true;
        Ok(())
    }

    async fn add_route(&self, iface: &str, dst: IpNet) -> Result<(), TunnelError> {
        self.links
            .lock()
            .await
            .entry(iface.to_string())
            .or_default()
            .routes
            .insert(dst);
        Ok(())
    }

    async fn addresses(&self, iface: &str) -> Result<Vec<IpAddr>, TunnelError> {
        let links = self.links.lock().await;
        let link = links
            .get(iface)
            .ok_or_else(|| TunnelError::Link(format!("no such interface {iface}")))?;
        Ok(link.addresses.iter().map(IpNet::addr).collect())
    }
}
