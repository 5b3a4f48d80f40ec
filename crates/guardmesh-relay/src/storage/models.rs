//! Data models for the relay registry.

use std::net::IpAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;

use guardmesh_core::{Field, ValidationError};
use guardmesh_crypto::{CryptoError, WgKey};

/// Relay server row as stored. Parsed lazily so one bad row never poisons a scan.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerRow {
    pub id: i64,
    pub name: String,
    pub public_ip: String,
    pub port: i64,
    pub private_ip: String,
    pub public_key: Vec<u8>,
    pub preshared_key: Vec<u8>,
}

/// A relay server with every field parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServer {
    pub id: i64,
    pub name: String,
    pub public_ip: IpAddr,
    pub port: u16,
    pub private_ip: IpAddr,
    pub public_key: WgKey,
    pub preshared_key: WgKey,
}

impl TryFrom<&ServerRow> for RelayServer {
    type Error = ValidationError;

    fn try_from(row: &ServerRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name.clone(),
            public_ip: guardmesh_core::net::parse_ip(Field::PublicIp, &row.public_ip)?,
            port: u16::try_from(row.port).map_err(|_| {
                ValidationError::new(Field::Port, format!("{} out of range", row.port))
            })?,
            private_ip: guardmesh_core::net::parse_ip(Field::PrivateIp, &row.private_ip)?,
            public_key: WgKey::from_slice(&row.public_key).map_err(key_error(Field::PublicKey))?,
            preshared_key: WgKey::from_slice(&row.preshared_key)
                .map_err(key_error(Field::PresharedKey))?,
        })
    }
}

fn key_error(field: Field) -> impl Fn(CryptoError) -> ValidationError {
    move |e| ValidationError::new(field, e.to_string())
}

/// Public view of a relay server for the control API. Never carries the
/// pre-shared key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct RelaySummary {
    pub id: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub pub_ip: String,
    pub port: i64,
    pub priv_ip: String,
    #[serde(serialize_with = "serialize_base64")]
    pub pub_key: Vec<u8>,
}

fn serialize_base64<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&BASE64.encode(bytes))
}

/// A scanned row whose columns do not have the expected types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("undecodable row: {reason}")]
pub struct UndecodableRow {
    pub id: Option<i64>,
    pub reason: String,
}

/// User row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub public_key: Vec<u8>,
    pub latest_ip: String,
}

impl UserRow {
    /// The latest tunnel address, or `None` when unset.
    pub fn latest_address(&self) -> Option<Result<IpAddr, ValidationError>> {
        if self.latest_ip.is_empty() {
            None
        } else {
            Some(guardmesh_core::net::parse_ip(Field::Address, &self.latest_ip))
        }
    }
}

/// Input for registering a relay server, as supplied by admin tooling.
#[derive(Debug, Clone, Default)]
pub struct NewServer<'a> {
    pub name: &'a str,
    pub public_ip: &'a str,
    pub port: u16,
    pub private_ip: &'a str,
    pub public_key: &'a str,
    pub preshared_key: &'a str,
}

/// Input for registering a user.
#[derive(Debug, Clone, Default)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub display_name: &'a str,
    pub public_key: &'a str,
    pub latest_ip: &'a str,
}
