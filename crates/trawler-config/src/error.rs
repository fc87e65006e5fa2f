//! Error types for configuration operations.

use thiserror::Error;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading, validating, or mutating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field contained an invalid value.
    #[error("invalid value for '{field}' in '{section}': {message}")]
    InvalidField {
        /// Section that failed validation.
        section: String,
        /// Field that failed validation.
        field: String,
        /// Human-readable description.
        message: String,
    },
    /// A referenced entity does not exist.
    #[error("unknown {kind} '{name}'")]
    Unknown {
        /// Entity kind (site, subscription, rule).
        kind: &'static str,
        /// Identifier that failed to resolve.
        name: String,
    },
    /// The bootstrap document could not be parsed.
    #[error("bootstrap document rejected: {detail}")]
    Document {
        /// Parse failure description.
        detail: String,
    },
    /// The database is already seeded; bootstrap import refused.
    #[error("configuration already seeded; the database is authoritative")]
    AlreadySeeded,
    /// An underlying data-layer operation failed.
    #[error("configuration persistence failed")]
    Data {
        /// Source data-layer error.
        #[from]
        source: trawler_data::DataError,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        section: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidField {
            section: section.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}
