//! `GuardMesh` Core Library
//!
//! Shared functionality for `GuardMesh` components:
//! - Error taxonomy (`ErrorKind`, field-level validation errors)
//! - Node configuration loading and validation
//! - Mesh addressing rules (mesh block, relay host, user scope)
//! - `SQLite` pool helpers and query deadlines
//! - Tracing initialisation

pub mod config;
pub mod db;
pub mod error;
pub mod net;
pub mod tracing_init;

pub use config::{NodeConfig, NodeRole};
pub use error::{Error, ErrorKind, Field, Result, ValidationError};
