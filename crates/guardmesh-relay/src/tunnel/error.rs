use std::time::Duration;

use guardmesh_core::{ErrorKind, ValidationError};

/// Tunnel device and link failures.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Tunnel operation '{op}' exceeded its {deadline:?} deadline")]
    Timeout { op: &'static str, deadline: Duration },

    #[error("Interface {0} is closed")]
    Closed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Device(_) | Self::Link(_) | Self::Closed(_) | Self::Io(_) => ErrorKind::Device,
        }
    }
}
