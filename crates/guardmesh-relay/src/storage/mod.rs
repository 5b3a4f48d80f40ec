//! SQLite registry of relay servers and users.
//!
//! Every call runs under a deadline: [`QUERY_TIMEOUT`] for single-row work and
//! [`SCAN_TIMEOUT`] for the synchronization scans.
//!
//! [`QUERY_TIMEOUT`]: guardmesh_core::db::QUERY_TIMEOUT
//! [`SCAN_TIMEOUT`]: guardmesh_core::db::SCAN_TIMEOUT

mod db;
mod models;
mod queries_servers;
mod queries_users;
mod validate;


pub use db::{RegistryDatabase, RegistryError};
pub use models::*;
pub use validate::{
    DEFAULT_SERVER_NAME, MAX_DISPLAY_NAME_LEN, MAX_SERVER_NAME_LEN, MAX_USERNAME_LEN,
};
