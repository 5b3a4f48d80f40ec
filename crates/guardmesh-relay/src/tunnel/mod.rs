//! Tunnel adapter: one WireGuard interface per process.
//!
//! [`TunnelAdapter`] owns the device and the link. Devices come from a
//! [`DeviceProvider`] ([`UapiProvider`] in production, [`MemoryProvider`] in
//! tests) and link changes go through [`LinkOps`].

mod adapter;
mod device;
mod error;
mod link;
mod memory;
mod uapi;

pub use adapter::{DEVICE_TIMEOUT, TunnelAdapter};
pub use device::{DeviceConfig, DeviceProvider, DeviceState, PeerConfig, TunnelDevice};
pub use error::TunnelError;
pub use link::{IpCommand, LinkOps};
pub use memory::{MemoryDevice, MemoryLink, MemoryProvider};
pub use uapi::{UapiDevice, UapiProvider, encode_set, parse_get};
