//! Control API gateway: axum routes served over mutually authenticated TLS.
//!
//! - `GET /relay-table` lists relay servers (never the pre-shared key)
//! - `POST /ip/replace` runs both phases of the IP claim
//! - `GET /healthz` readiness probe

pub mod api;
pub mod listener;

pub use api::{ApiError, AppState, build_router};
pub use listener::{HANDSHAKE_TIMEOUT, HEADER_READ_TIMEOUT, serve};
