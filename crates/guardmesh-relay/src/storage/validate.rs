//! Write-side validation. Everything here runs before the store is touched.

use std::net::IpAddr;

use guardmesh_core::net::{in_mesh_block, parse_ip};
use guardmesh_core::{Field, ValidationError};
use guardmesh_crypto::WgKey;

use super::models::{NewServer, NewUser};

/// Name stored for relays registered without one.
pub const DEFAULT_SERVER_NAME: &str = "default_server_name";

pub const MAX_SERVER_NAME_LEN: usize = 64;
pub const MAX_USERNAME_LEN: usize = 64;
pub const MAX_DISPLAY_NAME_LEN: usize = 128;

#[derive(Debug, Clone)]
pub(crate) struct ValidServer {
    pub name: String,
    pub public_ip: IpAddr,
    pub port: u16,
    pub private_ip: IpAddr,
    pub public_key: WgKey,
    pub preshared_key: WgKey,
}

#[derive(Debug, Clone)]
pub(crate) struct ValidUser {
    pub username: String,
    pub display_name: String,
    pub public_key: WgKey,
    /// Canonical address text, or empty when unset.
    pub latest_ip: String,
}

fn parse_key(field: Field, value: &str) -> Result<WgKey, ValidationError> {
    WgKey::from_base64(value).map_err(|e| ValidationError::new(field, e.to_string()))
}

pub(crate) fn validate_server(input: &NewServer<'_>) -> Result<ValidServer, ValidationError> {
    let public_key = parse_key(Field::PublicKey, input.public_key)?;
    let preshared_key = parse_key(Field::PresharedKey, input.preshared_key)?;

    let name = if input.name.is_empty() {
        DEFAULT_SERVER_NAME
    } else {
        input.name
    };
    if name.len() > MAX_SERVER_NAME_LEN {
        return Err(ValidationError::new(
            Field::Name,
            format!("longer than {MAX_SERVER_NAME_LEN} bytes"),
        ));
    }

    let public_ip = parse_ip(Field::PublicIp, input.public_ip)?;
    let private_ip = parse_ip(Field::PrivateIp, input.private_ip)?;
    if !in_mesh_block(private_ip) {
        return Err(ValidationError::new(
            Field::PrivateIp,
            format!("{private_ip} is outside 10.0.0.0/8"),
        ));
    }

    Ok(ValidServer {
        name: name.to_string(),
        public_ip,
        port: input.port,
        private_ip,
        public_key,
        preshared_key,
    })
}

pub(crate) fn validate_user(input: &NewUser<'_>) -> Result<ValidUser, ValidationError> {
    let public_key = parse_key(Field::PublicKey, input.public_key)?;

    let username = input.username;
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(ValidationError::new(
            Field::Username,
            format!("must be 1 to {MAX_USERNAME_LEN} bytes"),
        ));
    }
    if !username.is_ascii() {
        return Err(ValidationError::new(
            Field::Username,
            "only 7-bit ASCII characters are allowed",
        ));
    }

    let display_name = input.display_name;
    if display_name.is_empty() || display_name.len() > MAX_DISPLAY_NAME_LEN {
        return Err(ValidationError::new(
            Field::DisplayName,
            format!("must be 1 to {MAX_DISPLAY_NAME_LEN} bytes"),
        ));
    }

    let latest_ip = if input.latest_ip.trim().is_empty() {
        String::new()
    } else {
        parse_ip(Field::Address, input.latest_ip)?.to_string()
    };

    Ok(ValidUser {
        username: username.to_string(),
        display_name: display_name.to_string(),
        public_key,
        latest_ip,
    })
}
