//! Link-level operations below the tunnel device: addresses, MTU, link
//! state and the mesh route.

use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::process::Output;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::process::Command;
use tracing::{info, warn};

use super::error::TunnelError;

#[async_trait]
pub trait LinkOps: Send + Sync {
    async fn add_address(&self, iface: &str, addr: IpNet) -> Result<(), TunnelError>;

    async fn set_mtu(&self, iface: &str, mtu: u32) -> Result<(), TunnelError>;

    async fn set_up(&self, iface: &str) -> Result<(), TunnelError>;

    /// Route `dst` through `iface`. An existing identical route is success.
    async fn add_route(&self, iface: &str, dst: IpNet) -> Result<(), TunnelError>;

    /// Addresses currently assigned to `iface`.
    async fn addresses(&self, iface: &str) -> Result<Vec<IpAddr>, TunnelError>;
}

/// Whether `ip` stderr reports an already-present object.
fn is_already_exists_error(stderr: &str) -> bool {
    stderr.contains("File exists")
}

/// iproute2-backed link operations (Linux).
#[derive(Debug, Clone, Default)]
pub struct IpCommand;

impl IpCommand {
    async fn run(&self, args: &[&str]) -> Result<Output, TunnelError> {
        Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| TunnelError::Link(format!("failed to execute ip {}: {e}", args.join(" "))))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<(), TunnelError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TunnelError::Link(format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl LinkOps for IpCommand {
    async fn add_address(&self, iface: &str, addr: IpNet) -> Result<(), TunnelError> {
        self.run_checked(&["addr", "add", &addr.to_string(), "dev", iface])
            .await?;
        info!(iface, %addr, "Address assigned");
        Ok(())
    }

    async fn set_mtu(&self, iface: &str, mtu: u32) -> Result<(), TunnelError> {
        self.run_checked(&["link", "set", "dev", iface, "mtu", &mtu.to_string()])
            .await
    }

    async fn set_up(&self, iface: &str) -> Result<(), TunnelError> {
        self.run_checked(&["link", "set", "dev", iface, "up"]).await
    }

    async fn add_route(&self, iface: &str, dst: IpNet) -> Result<(), TunnelError> {
        let dst_str = dst.to_string();
        let output = self.run(&["route", "add", &dst_str, "dev", iface]).await?;
        if output.status.success() {
            info!(iface, route = %dst, "Mesh route added");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_already_exists_error(&stderr) {
            warn!(iface, route = %dst, "Route already exists (treating as success)");
            Ok(())
        } else {
            Err(TunnelError::Link(format!(
                "failed to add route {dst} via {iface}: {}",
                stderr.trim()
            )))
        }
    }

    async fn addresses(&self, iface: &str) -> Result<Vec<IpAddr>, TunnelError> {
        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| TunnelError::Link(format!("getifaddrs: {e}")))?;

        let found = addrs
            .filter(|ifa| ifa.interface_name == iface)
            .filter_map(|ifa| {
                let storage = ifa.address?;
                if let Some(sin) = storage.as_sockaddr_in() {
                    Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()))
                } else {
                    storage
                        .as_sockaddr_in6()
                        .map(|sin6| IpAddr::V6(*SocketAddrV6::from(*sin6).ip()))
                }
            })
            .collect();
        Ok(found)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exists_detection() {
        assert!(is_already_exists_error("RTNETLINK answers: File exists\n"));
        assert!(!is_already_exists_error("RTNETLINK answers: Operation not permitted"));
    }

    #[tokio::test]
    async fn loopback_has_an_address() {
        let addrs = IpCommand.addresses("lo").await.unwrap();
        assert!(addrs.iter().any(IpAddr::is_loopback));
    }
}
