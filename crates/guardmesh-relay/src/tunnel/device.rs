//! Tunnel device abstraction.
//!
//! A [`TunnelDevice`] is a running WireGuard-protocol implementation that
//! can be configured and read back. [`DeviceProvider`] creates one per
//! interface name.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use guardmesh_crypto::WgKey;
use ipnet::IpNet;

use super::error::TunnelError;

/// One peer entry in a device configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: WgKey,
    pub preshared_key: Option<WgKey>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<Duration>,
    /// Replace the peer's allowed-address list instead of appending to it.
    pub replace_allowed_ips: bool,
}

/// A configuration update. `None` fields leave the device's value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub private_key: Option<WgKey>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    /// Drop every existing peer before applying `peers`.
    pub replace_peers: bool,
    pub peers: Vec<PeerConfig>,
}

/// Device state as read back from the running implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub private_key: Option<WgKey>,
    pub listen_port: u16,
    pub fwmark: u32,
    pub peers: Vec<PeerConfig>,
}

#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Interface name the device is bound to.
    fn name(&self) -> &str;

    async fn configure(&self, config: &DeviceConfig) -> Result<(), TunnelError>;

    async fn state(&self) -> Result<DeviceState, TunnelError>;

    /// Release the device. Calling this more than once is harmless.
    async fn close(&self) -> Result<(), TunnelError>;
}

#[async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn create(&self, name: &str) -> Result<Box<dyn TunnelDevice>, TunnelError>;
}
