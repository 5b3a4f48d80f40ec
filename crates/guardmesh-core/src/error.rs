//! Error taxonomy shared by every `GuardMesh` component.
//!
//! Component errors (registry, tunnel, claim, sync) are separate enums, but
//! each maps onto one [`ErrorKind`] so callers can decide between "reject the
//! request" and "tear the node down" without matching on messages.

use std::fmt;

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of every failure in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input, caught before any I/O.
    Validation,
    /// Unique-constraint violation on write.
    Conflict,
    /// Lookup miss.
    NotFound,
    /// Signature or certificate verification failure.
    Auth,
    /// Deadline exceeded on a store or tunnel operation.
    Timeout,
    /// Any other store failure.
    Storage,
    /// Tunnel or link configuration failure.
    Device,
}

impl ErrorKind {
    /// Whether this kind is handled locally as a rejection with no side effect.
    pub const fn is_rejection(self) -> bool {
        matches!(self, Self::Validation | Self::Auth | Self::NotFound | Self::Conflict)
    }

    /// Whether this kind is fatal for the task that owns the tunnel.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Storage | Self::Device | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::Storage => "storage",
            Self::Device => "device",
        };
        f.write_str(s)
    }
}

/// Input field named by a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    PublicKey,
    PresharedKey,
    PrivateKey,
    PublicIp,
    PrivateIp,
    Port,
    Username,
    DisplayName,
    Address,
    Mtu,
    NonceTtl,
    Signature,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Name => "name",
            Self::PublicKey => "public_key",
            Self::PresharedKey => "preshared_key",
            Self::PrivateKey => "private_key",
            Self::PublicIp => "public_ip",
            Self::PrivateIp => "private_ip",
            Self::Port => "port",
            Self::Username => "username",
            Self::DisplayName => "display_name",
            Self::Address => "address",
            Self::Mtu => "mtu",
            Self::NonceTtl => "nonce_ttl",
            Self::Signature => "sig",
        };
        f.write_str(s)
    }
}

/// A rejected input value, naming the field and the reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: Field,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: Field, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Core error types for configuration and bootstrap.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configuration value failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Validation(_) => ErrorKind::Validation,
            Self::Io(_) => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_field() {
        let err = ValidationError::new(Field::PresharedKey, "expected 32 bytes");
        assert_eq!(err.to_string(), "invalid preshared_key: expected 32 bytes");
    }

    #[test]
    fn rejection_and_fatal_kinds_are_disjoint() {
        let kinds = [
            ErrorKind::Validation,
            ErrorKind::Conflict,
            ErrorKind::NotFound,
            ErrorKind::Auth,
            ErrorKind::Timeout,
            ErrorKind::Storage,
            ErrorKind::Device,
        ];
        for kind in kinds {
            assert!(!(kind.is_rejection() && kind.is_fatal()), "{kind}");
        }
    }
}
