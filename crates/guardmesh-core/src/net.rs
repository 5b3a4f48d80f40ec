//! Mesh addressing rules.
//!
//! All tunnel addresses are drawn from the mesh block (10.0.0.0/8). Relay
//! servers always take the `.1` host (or `::1` suffix for IPv6), and a relay
//! is authoritative for the users in its own /24 (IPv4) or /64 (IPv6).

use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{Field, ValidationError};

/// Prefix length of the mesh block.
pub const MESH_PREFIX_LEN: u8 = 8;

/// Prefix length of the subnet a relay serves on IPv4.
pub const USER_SCOPE_V4: u8 = 24;

/// Prefix length of the subnet a relay serves on IPv6.
pub const USER_SCOPE_V6: u8 = 64;

/// The reserved mesh block, 10.0.0.0/8.
pub fn mesh_block() -> Ipv4Net {
    Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), MESH_PREFIX_LEN)
}

/// Whether `ip` lies inside the mesh block. IPv6 addresses never do.
pub fn in_mesh_block(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => mesh_block().contains(&v4),
        IpAddr::V6(_) => false,
    }
}

/// Whether `ip` carries the reserved relay host identifier:
/// last octet `1` for IPv4, last 16 bits `1` for IPv6.
pub fn is_relay_host(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[3] == 1,
        IpAddr::V6(v6) => v6.segments()[7] == 1,
    }
}

/// The single-host network for `ip` (/32 or /128).
pub fn host_net(ip: IpAddr) -> IpNet {
    IpNet::from(ip)
}

/// The subnet of users a relay at `local` is authoritative for.
pub fn user_scope(local: IpAddr) -> IpNet {
    match local {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::new_assert(v4, USER_SCOPE_V4).trunc()),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::new_assert(v6, USER_SCOPE_V6).trunc()),
    }
}

/// Parse an IP literal, naming `field` on failure.
pub fn parse_ip(field: Field, value: &str) -> Result<IpAddr, ValidationError> {
    value
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| ValidationError::new(field, format!("'{value}' is not an IP literal")))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn mesh_block_membership() {
        assert!(in_mesh_block(ip("10.0.0.1")));
        assert!(in_mesh_block(ip("10.255.255.254")));
        assert!(!in_mesh_block(ip("11.0.0.1")));
        assert!(!in_mesh_block(ip("192.168.1.1")));
        assert!(!in_mesh_block(ip("fd00::1")));
    }

    #[test]
    fn relay_host_rule() {
        assert!(is_relay_host(ip("10.1.2.1")));
        assert!(!is_relay_host(ip("10.1.2.2")));
        assert!(is_relay_host(ip("fd00:1:2:3::1")));
        assert!(!is_relay_host(ip("fd00:1:2:3::2")));
        assert!(!is_relay_host(ip("fd00:1:2:3::1:0")));
    }

    #[test]
    fn user_scope_is_slash_24_or_64() {
        assert_eq!(user_scope(ip("10.1.2.1")).to_string(), "10.1.2.0/24");
        assert_eq!(user_scope(ip("fd00:1:2:3::1")).to_string(), "fd00:1:2:3::/64");
        assert!(user_scope(ip("10.1.2.1")).contains(&ip("10.1.2.77")));
        assert!(!user_scope(ip("10.1.2.1")).contains(&ip("10.1.3.77")));
    }

    #[test]
    fn host_net_is_single_address() {
        assert_eq!(host_net(ip("10.0.0.5")).to_string(), "10.0.0.5/32");
        assert_eq!(host_net(ip("fd00::5")).to_string(), "fd00::5/128");
    }

    #[test]
    fn parse_ip_names_field() {
        let err = parse_ip(Field::PublicIp, "not-an-ip").unwrap_err();
        assert_eq!(err.field, Field::PublicIp);
        assert_eq!(parse_ip(Field::PublicIp, " 1.2.3.4 ").unwrap(), ip("1.2.3.4"));
    }
}
