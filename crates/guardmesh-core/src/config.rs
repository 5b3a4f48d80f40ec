//! Node configuration for `GuardMesh`.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. TOML file (explicit `--config` path, or `~/.guardmesh/node.toml` when present)
//! 3. CLI flags and `GUARDMESH_*` environment variables (applied by the binary)

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Field, Result, ValidationError};
use crate::net;

/// Default MTU applied when the configured value is 0.
pub const DEFAULT_MTU: u32 = 1500;

/// Smallest accepted tunnel MTU.
pub const MIN_MTU: u32 = 800;

/// Largest accepted tunnel MTU.
pub const MAX_MTU: u32 = 1700;

/// Upper bound on the lifetime of an IP-claim challenge.
pub const MAX_NONCE_TTL_SECS: u64 = 30;

/// Role a node plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Relay server: owns a `.1` address and serves the control API.
    #[default]
    Server,
    /// End-user client interface.
    Client,
}

impl FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            other => Err(Error::Config(format!("unknown node role '{other}'"))),
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub role: NodeRole,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub claim: ClaimConfig,
}

/// Tunnel interface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub interface: String,
    /// Private tunnel address of this node.
    pub address: Option<IpAddr>,
    /// Base64 WireGuard private key; generated at startup when absent.
    pub private_key: Option<String>,
    pub listen_port: u16,
    /// 0 selects [`DEFAULT_MTU`].
    pub mtu: u32,
    /// Userspace WireGuard implementation to spawn.
    pub userspace_binary: PathBuf,
    /// Directory holding the UAPI control sockets.
    pub uapi_dir: PathBuf,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            address: None,
            private_key: None,
            listen_port: 51820,
            mtu: 0,
            userspace_binary: PathBuf::from("wireguard-go"),
            uapi_dir: PathBuf::from("/var/run/wireguard"),
        }
    }
}

impl TunnelConfig {
    /// MTU with the zero default resolved.
    pub const fn effective_mtu(&self) -> u32 {
        if self.mtu == 0 { DEFAULT_MTU } else { self.mtu }
    }
}

/// Registry database settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

/// Control API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub bind: SocketAddr,
    /// Directory holding `ca.crt`, `node.crt` and `node.key`.
    pub cert_dir: Option<PathBuf>,
    /// Grace period for in-flight requests on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8089)),
            cert_dir: None,
            shutdown_grace_secs: 5,
        }
    }
}

impl ControlConfig {
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Peer synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl SyncConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// IP-claim protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    pub nonce_ttl_secs: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            nonce_ttl_secs: MAX_NONCE_TTL_SECS,
        }
    }
}

impl ClaimConfig {
    pub const fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }
}

impl NodeConfig {
    /// Check cross-field rules that serde cannot express.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        check_mtu(self.tunnel.mtu)?;

        if self.claim.nonce_ttl_secs == 0 || self.claim.nonce_ttl_secs > MAX_NONCE_TTL_SECS {
            return Err(ValidationError::new(
                Field::NonceTtl,
                format!("must be between 1 and {MAX_NONCE_TTL_SECS} seconds"),
            ));
        }

        if let Some(address) = self.tunnel.address {
            check_role_address(self.role, address)?;
        }

        Ok(())
    }
}

/// Check an MTU against the accepted range. 0 means "default".
pub fn check_mtu(mtu: u32) -> std::result::Result<u32, ValidationError> {
    let mtu = if mtu == 0 { DEFAULT_MTU } else { mtu };
    if (MIN_MTU..=MAX_MTU).contains(&mtu) {
        Ok(mtu)
    } else {
        Err(ValidationError::new(
            Field::Mtu,
            format!("{mtu} is outside [{MIN_MTU}, {MAX_MTU}]"),
        ))
    }
}

/// Servers must take the relay host address; clients must stay in the mesh.
pub fn check_role_address(
    role: NodeRole,
    address: IpAddr,
) -> std::result::Result<(), ValidationError> {
    match role {
        NodeRole::Server if !net::is_relay_host(address) => Err(ValidationError::new(
            Field::Address,
            format!("server address {address} must end in .1 (or ::1)"),
        )),
        NodeRole::Client if address.is_ipv4() && !net::in_mesh_block(address) => {
            Err(ValidationError::new(
                Field::Address,
                format!("client address {address} is outside the mesh block"),
            ))
        }
        _ => Ok(()),
    }
}

/// Default location of the node config file: `~/.guardmesh/node.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    guardmesh_dir().map(|d| d.join("node.toml"))
}

/// Default location of the registry database: `~/.guardmesh/registry.db`.
pub fn default_database_path() -> Option<PathBuf> {
    guardmesh_dir().map(|d| d.join("registry.db"))
}

/// Default certificate directory: `~/.guardmesh/certs`.
pub fn default_cert_dir() -> Option<PathBuf> {
    guardmesh_dir().map(|d| d.join("certs"))
}

fn guardmesh_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".guardmesh"))
}

/// Load the node configuration.
///
/// An explicit path must exist. Without one, the default path is used when
/// present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let config = match path {
        Some(path) => load_config_file(path)?,
        None => match default_config_path() {
            Some(default) if default.exists() => load_config_file(&default)?,
            _ => NodeConfig::default(),
        },
    };
    config.validate()?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<NodeConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tunnel.interface, "wg0");
        assert_eq!(config.tunnel.effective_mtu(), 1500);
        assert_eq!(config.control.bind.port(), 8089);
        assert_eq!(config.claim.nonce_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn mtu_bounds() {
        assert_eq!(check_mtu(0).unwrap(), 1500);
        assert_eq!(check_mtu(800).unwrap(), 800);
        assert_eq!(check_mtu(1700).unwrap(), 1700);
        assert_eq!(check_mtu(799).unwrap_err().field, Field::Mtu);
        assert_eq!(check_mtu(1701).unwrap_err().field, Field::Mtu);
    }

    #[test]
    fn server_address_must_be_relay_host() {
        let ok: IpAddr = "10.3.4.1".parse().unwrap();
        let bad: IpAddr = "10.3.4.9".parse().unwrap();
        assert!(check_role_address(NodeRole::Server, ok).is_ok());
        assert!(check_role_address(NodeRole::Server, bad).is_err());
        assert!(check_role_address(NodeRole::Client, bad).is_ok());
    }

    #[test]
    fn nonce_ttl_is_capped() {
        let mut config = NodeConfig::default();
        config.claim.nonce_ttl_secs = 31;
        assert_eq!(config.validate().unwrap_err().field, Field::NonceTtl);
        config.claim.nonce_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
role = "server"

[tunnel]
interface = "gm0"
address = "10.9.8.1"
mtu = 1420

[control]
bind = "127.0.0.1:9000"

[claim]
nonce_ttl_secs = 10
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.tunnel.interface, "gm0");
        assert_eq!(config.tunnel.address, Some("10.9.8.1".parse().unwrap()));
        assert_eq!(config.tunnel.effective_mtu(), 1420);
        assert_eq!(config.tunnel.listen_port, 51820);
        assert_eq!(config.control.bind.port(), 9000);
        assert_eq!(config.claim.nonce_ttl_secs, 10);
        assert_eq!(config.sync.interval_secs, 60);
    }

    #[test]
    fn load_rejects_server_without_relay_host() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tunnel]\naddress = \"10.9.8.7\"").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, Error::Validation(ref v) if v.field == Field::Address));
    }

    #[test]
    fn load_missing_explicit_path_fails() {
        let err = load_config(Some(Path::new("/nonexistent/node.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Server".parse::<NodeRole>().unwrap(), NodeRole::Server);
        assert_eq!("client".parse::<NodeRole>().unwrap(), NodeRole::Client);
        assert!("relay".parse::<NodeRole>().is_err());
    }
}
