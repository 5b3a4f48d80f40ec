//! `SQLite` registry database for `GuardMesh` relays.

use std::future::Future;
use std::time::Duration;

use guardmesh_core::db::DatabaseError;
use guardmesh_core::{ErrorKind, Field, ValidationError};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use super::models::UndecodableRow;

guardmesh_core::define_database!(RegistryDatabase, "Registry database migrations complete");

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Conflict: {field} '{value}' already exists")]
    Conflict { field: Field, value: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Registry query exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl RegistryError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<DatabaseError> for RegistryError {
    fn from(e: DatabaseError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Decode scanned rows one by one so a single bad row stays a single bad row.
pub(crate) fn decode_each<T>(rows: Vec<SqliteRow>) -> Vec<Result<T, UndecodableRow>>
where
    T: for<'r> FromRow<'r, SqliteRow>,
{
    rows.iter()
        .map(|row| {
            T::from_row(row).map_err(|e| UndecodableRow {
                id: row.try_get::<i64, _>("id").ok(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Run a store call under `deadline`, mapping expiry to [`RegistryError::Timeout`].
pub(crate) async fn with_deadline<T, E, F>(deadline: Duration, fut: F) -> Result<T, RegistryError>
where
    F: Future<Output = Result<T, E>>,
    RegistryError: From<E>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(RegistryError::from),
        Err(_) => Err(RegistryError::Timeout(deadline)),
    }
}
