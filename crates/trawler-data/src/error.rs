//! Error types for the data access layer.

use thiserror::Error;

/// Result alias for data layer operations.
pub type DataResult<T> = Result<T, DataError>;

/// Errors raised by the data access layer.
#[derive(Debug, Error)]
pub enum DataError {
    /// Migration execution failed.
    #[error("migration failed")]
    Migration {
        /// Underlying migration error.
        #[source]
        source: sqlx::migrate::MigrateError,
    },
    /// A database operation failed.
    #[error("database operation '{operation}' failed")]
    Query {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying SQL error.
        #[source]
        source: sqlx::Error,
    },
    /// A stored value no longer decodes into its domain type.
    #[error("stored value could not be decoded: {detail}")]
    Corrupt {
        /// Decode failure description.
        detail: String,
    },
}

impl DataError {
    pub(crate) const fn query(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Query { operation, source }
    }
}

/// Attach an operation identifier to a raw `sqlx` result.
pub(crate) trait QueryContext<T> {
    fn for_op(self, operation: &'static str) -> DataResult<T>;
}

impl<T> QueryContext<T> for Result<T, sqlx::Error> {
    fn for_op(self, operation: &'static str) -> DataResult<T> {
        self.map_err(|source| DataError::query(operation, source))
    }
}
