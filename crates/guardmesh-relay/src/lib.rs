//! `GuardMesh` relay node library
//!
//! - `SQLite` registry of relay servers and users
//! - Tunnel adapter over a userspace WireGuard device
//! - Peer synchronization from the registry to the tunnel
//! - Two-phase IP claim protocol
//! - mTLS control API with graceful shutdown
//! - Supervised task group tying the node together

pub mod claim;
pub mod node;
pub mod server;
pub mod storage;
pub mod supervisor;
pub mod sync;
pub mod tls;
pub mod tunnel;
