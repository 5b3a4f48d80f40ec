//! User queries, including the claim protocol's conditional address write.

use std::net::IpAddr;

use guardmesh_core::db::{QUERY_TIMEOUT, SCAN_TIMEOUT, unix_timestamp};
use guardmesh_core::net::USER_SCOPE_V4;
use guardmesh_crypto::WgKey;
use ipnet::IpNet;
use tracing::{debug, info};

use super::db::{RegistryDatabase, RegistryError, decode_each, with_deadline};
use super::models::{NewUser, UndecodableRow, UserRow};
use super::validate::validate_user;

impl RegistryDatabase {
    /// Register a user and return the assigned id.
    pub async fn add_user(&self, input: &NewUser<'_>) -> Result<i64, RegistryError> {
        let user = validate_user(input)?;
        let now = unix_timestamp();

        let id = with_deadline(
            QUERY_TIMEOUT,
            sqlx::query(
                "INSERT INTO users (username, display_name, public_key, latest_ip, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&user.username)
            .bind(&user.display_name)
            .bind(user.public_key.as_bytes().as_slice())
            .bind(&user.latest_ip)
            .bind(now)
            .execute(self.pool()),
        )
        .await?
        .last_insert_rowid();

        info!(id, username = %user.username, "User registered");
        Ok(id)
    }

    /// The id of the user whose latest address is `address`.
    ///
    /// The claim protocol keeps addresses exclusive; if a stale registry still
    /// holds duplicates the lowest id wins.
    pub async fn lookup_user_by_address(&self, address: IpAddr) -> Result<i64, RegistryError> {
        with_deadline(
            QUERY_TIMEOUT,
            sqlx::query_scalar::<_, i64>(
                "SELECT id FROM users WHERE latest_ip = ? ORDER BY id LIMIT 1",
            )
            .bind(address.to_string())
            .fetch_optional(self.pool()),
        )
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("User holding {address}")))
    }

    /// Registered public key of `user_id`.
    pub async fn get_user_public_key(&self, user_id: i64) -> Result<WgKey, RegistryError> {
        let bytes = with_deadline(
            QUERY_TIMEOUT,
            sqlx::query_scalar::<_, Vec<u8>>("SELECT public_key FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(self.pool()),
        )
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("User {user_id}")))?;

        WgKey::from_slice(&bytes).map_err(|e| {
            RegistryError::Storage(format!("User {user_id} has a corrupt public key: {e}"))
        })
    }

    /// Whether a user other than `user_id` currently holds `address`.
    pub async fn address_held_by_other(
        &self,
        user_id: i64,
        address: IpAddr,
    ) -> Result<bool, RegistryError> {
        let holder = with_deadline(
            QUERY_TIMEOUT,
            sqlx::query_scalar::<_, i64>(
                "SELECT id FROM users WHERE latest_ip = ? AND id <> ? LIMIT 1",
            )
            .bind(address.to_string())
            .bind(user_id)
            .fetch_optional(self.pool()),
        )
        .await?;
        Ok(holder.is_some())
    }

    /// Record `address` as the latest address of `user_id`.
    ///
    /// A single conditional statement: the row changes only if the value is
    /// new and no other user holds `address`. Returns whether exactly one row
    /// changed; `false` covers "already set", "unknown user" and a lost race.
    pub async fn set_user_latest_address(
        &self,
        user_id: i64,
        address: IpAddr,
    ) -> Result<bool, RegistryError> {
        let changed = with_deadline(
            QUERY_TIMEOUT,
            sqlx::query(
                "UPDATE users SET latest_ip = ?1 WHERE id = ?2 AND latest_ip <> ?1 \
                 AND NOT EXISTS (SELECT 1 FROM users WHERE latest_ip = ?1 AND id <> ?2)",
            )
            .bind(address.to_string())
            .bind(user_id)
            .execute(self.pool()),
        )
        .await?
        .rows_affected();

        debug!(user_id, %address, changed, "Latest address write");
        Ok(changed == 1)
    }

    /// Users whose latest address falls within `scope`.
    ///
    /// IPv4 scopes are prefiltered in SQL on the dotted prefix; the caller
    /// still checks containment on the parsed address. Rows are decoded one
    /// by one, as in [`RegistryDatabase::servers_except`].
    pub async fn users_in_scope(
        &self,
        scope: IpNet,
    ) -> Result<Vec<Result<UserRow, UndecodableRow>>, RegistryError> {
        let query = match scope {
            IpNet::V4(net) if net.prefix_len() == USER_SCOPE_V4 => {
                let [a, b, c, _] = net.network().octets();
                sqlx::query(
                    "SELECT id, username, display_name, public_key, latest_ip FROM users WHERE latest_ip LIKE ? ORDER BY id",
                )
                .bind(format!("{a}.{b}.{c}.%"))
            }
            _ => sqlx::query(
                "SELECT id, username, display_name, public_key, latest_ip FROM users WHERE latest_ip <> '' ORDER BY id",
            ),
        };
        let rows = with_deadline(SCAN_TIMEOUT, query.fetch_all(self.pool())).await?;
        Ok(decode_each(rows))
    }
}
