//! Engine error kinds.

use thiserror::Error;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by ticks and reloads.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A driver operation failed after its own retry policy ran out.
    #[error("driver operation failed")]
    Driver {
        /// Source driver error.
        #[from]
        source: trawler_core::error::DriverError,
    },
    /// Store I/O failed; upserts and claims are idempotent, so retry is
    /// safe.
    #[error("persistence failed")]
    Persist {
        /// Source data-layer error.
        #[from]
        source: trawler_data::DataError,
    },
    /// A configuration entity was invalid at reload time; the affected job
    /// is skipped, others are unaffected.
    #[error("invalid configuration for job '{job}': {detail}")]
    Config {
        /// Job key the entity belongs to.
        job: String,
        /// Failure description.
        detail: String,
    },
    /// The enclosing scope was cancelled; never logged as an error.
    #[error("tick cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether the error is a cancellation, which callers drop silently.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Driver {
                    source: trawler_core::error::DriverError::Cancelled,
                }
        )
    }
}
