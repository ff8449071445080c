//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid stored value: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for fleetci_core::Error {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(what) => fleetci_core::Error::NotFound(what),
            other => fleetci_core::Error::Storage(other.to_string()),
        }
    }
}
