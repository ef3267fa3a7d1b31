use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

/// Errors raised by [`crate::storage::StorageGateway`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// Could not check a connection out of the pool (or build the pool).
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    /// Statement failed.
    #[error("database error: {0}")]
    Query(#[from] DieselError),

    /// Existing rows violate a uniqueness key.
    #[error("key violation on {table}: {message}")]
    KeyViolation { table: String, message: String },

    /// The rows or the request cannot be mapped onto a table.
    #[error("schema error on {table}: {message}")]
    Schema { table: String, message: String },

    /// A stored value could not be decoded.
    #[error("cannot decode {table}: {message}")]
    Decode { table: String, message: String },

    /// The blocking task running the operation panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl StorageError {
    pub(crate) fn schema(table: &str, message: impl Into<String>) -> Self {
        StorageError::Schema {
            table: table.to_string(),
            message: message.into(),
        }
    }

    /// Rewrites uniqueness failures into [`StorageError::KeyViolation`].
    pub(crate) fn classify(table: &str, err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StorageError::KeyViolation {
                    table: table.to_string(),
                    message: info.message().to_string(),
                }
            }
            DieselError::DatabaseError(_, ref info)
                if info.message().contains("UNIQUE constraint failed") =>
            {
                StorageError::KeyViolation {
                    table: table.to_string(),
                    message: info.message().to_string(),
                }
            }
            other => StorageError::Query(other),
        }
    }

    pub fn is_key_violation(&self) -> bool {
        matches!(self, StorageError::KeyViolation { .. })
    }
}
