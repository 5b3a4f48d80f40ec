//! Relay server queries.

use std::net::IpAddr;

use guardmesh_core::Field;
use guardmesh_core::db::{QUERY_TIMEOUT, SCAN_TIMEOUT, unix_timestamp};
use tracing::info;

use super::db::{RegistryDatabase, RegistryError, decode_each, with_deadline};
use super::models::{NewServer, RelaySummary, ServerRow, UndecodableRow};
use super::validate::{ValidServer, validate_server};

impl RegistryDatabase {
    /// Register a relay server and return its assigned id.
    ///
    /// Input is validated before the store is touched. A duplicate private
    /// address or public key fails with [`RegistryError::Conflict`] and writes
    /// nothing.
    pub async fn add_server(&self, input: &NewServer<'_>) -> Result<i64, RegistryError> {
        let server = validate_server(input)?;
        let now = unix_timestamp();

        let id = with_deadline(QUERY_TIMEOUT, async {
            sqlx::query(
                "INSERT INTO relay_servers (name, public_ip, port, private_ip, public_key, preshared_key, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&server.name)
            .bind(server.public_ip.to_string())
            .bind(i64::from(server.port))
            .bind(server.private_ip.to_string())
            .bind(server.public_key.as_bytes().as_slice())
            .bind(server.preshared_key.as_bytes().as_slice())
            .bind(now)
            .execute(self.pool())
            .await
            .map(|done| done.last_insert_rowid())
            .map_err(|e| server_conflict(e, &server))
        })
        .await?;

        info!(id, name = %server.name, private_ip = %server.private_ip, "Relay server registered");
        Ok(id)
    }

    /// Relay summaries for API exposure, ordered by id. Never includes
    /// pre-shared keys.
    pub async fn list_servers(&self) -> Result<Vec<RelaySummary>, RegistryError> {
        with_deadline(
            QUERY_TIMEOUT,
            sqlx::query_as::<_, RelaySummary>(
                "SELECT id, name, public_ip AS pub_ip, port, private_ip AS priv_ip, public_key AS pub_key FROM relay_servers ORDER BY id",
            )
            .fetch_all(self.pool()),
        )
        .await
    }

    /// Full server rows other than the one at `local`, for peer synchronization.
    ///
    /// Only a failed query is an error; rows that do not decode come back as
    /// [`UndecodableRow`] entries in place.
    pub async fn servers_except(
        &self,
        local: IpAddr,
    ) -> Result<Vec<Result<ServerRow, UndecodableRow>>, RegistryError> {
        let rows = with_deadline(
            SCAN_TIMEOUT,
            sqlx::query(
                "SELECT id, name, public_ip, port, private_ip, public_key, preshared_key FROM relay_servers WHERE private_ip <> ? ORDER BY id",
            )
            .bind(local.to_string())
            .fetch_all(self.pool()),
        )
        .await?;
        Ok(decode_each(rows))
    }
}

/// Map a unique-constraint violation to the column that collided.
fn server_conflict(e: sqlx::Error, server: &ValidServer) -> RegistryError {
    let on_private_ip = e
        .as_database_error()
        .filter(|db| db.is_unique_violation())
        .map(|db| db.message().contains("private_ip"));
    match on_private_ip {
        None => e.into(),
        Some(true) => RegistryError::Conflict {
            field: Field::PrivateIp,
            value: server.private_ip.to_string(),
        },
        Some(false) => RegistryError::Conflict {
            field: Field::PublicKey,
            value: server.public_key.to_base64(),
        },
    }
}
