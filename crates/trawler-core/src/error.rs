//! Shared error kinds with fixed semantics.
//!
//! Each variant maps to exactly one recovery policy: `Transient` is absorbed
//! by driver-local retries, `Auth` fails fast until configuration changes,
//! `RateLimited` ends the tick cleanly, `Parse` skips the item, and
//! `Cancelled` is never logged as an error.

use thiserror::Error;

/// Result alias for site-driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by site drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Credentials were rejected (401/403); the session is invalid until
    /// configuration is refreshed.
    #[error("site '{site}' rejected credentials")]
    Auth {
        /// Site identifier.
        site: String,
    },
    /// The remote returned 429 or the local limiter blocked past its
    /// deadline.
    #[error("site '{site}' rate limited")]
    RateLimited {
        /// Site identifier.
        site: String,
    },
    /// A retryable failure: 5xx, connection error, or timeout.
    #[error("transient failure talking to '{site}': {detail}")]
    Transient {
        /// Site identifier.
        site: String,
        /// Failure description.
        detail: String,
    },
    /// A non-auth 4xx; fatal for the item, no retry.
    #[error("site '{site}' rejected the request with status {status}")]
    Rejected {
        /// Site identifier.
        site: String,
        /// HTTP status code.
        status: u16,
    },
    /// A page or payload could not be parsed; the item is skipped.
    #[error("failed to parse response from '{site}': {detail}")]
    Parse {
        /// Site identifier.
        site: String,
        /// Parse failure description.
        detail: String,
    },
    /// Handing a record to the downloader failed.
    #[error("downloader rejected a submission")]
    Downloader {
        /// Underlying adapter error.
        #[from]
        source: DownloaderError,
    },
    /// The enclosing scope was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl DriverError {
    /// Whether the driver retry policy may re-attempt the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether the error indicates an invalid session.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// Result alias for downloader-adapter operations.
pub type DownloaderResult<T> = Result<T, DownloaderError>;

/// Errors surfaced by the downloader adapter.
#[derive(Debug, Error)]
pub enum DownloaderError {
    /// The WebUI rejected the configured credentials.
    #[error("downloader login failed")]
    Login,
    /// The WebUI rejected a request even after a fresh login.
    #[error("downloader request failed with status {status}")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },
    /// Connection error or timeout talking to the WebUI.
    #[error("downloader unreachable: {detail}")]
    Unreachable {
        /// Failure description.
        detail: String,
    },
    /// The response payload could not be decoded.
    #[error("downloader response could not be decoded: {detail}")]
    Decode {
        /// Failure description.
        detail: String,
    },
    /// The info-hash could not be derived for this submission shape.
    #[error("info-hash unavailable: {detail}")]
    HashUnavailable {
        /// Why the hash could not be derived.
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        let transient = DriverError::Transient {
            site: "hdsky".to_string(),
            detail: "503".to_string(),
        };
        assert!(transient.is_retryable());

        let auth = DriverError::Auth {
            site: "hdsky".to_string(),
        };
        assert!(!auth.is_retryable());
        assert!(auth.is_auth());

        assert!(!DriverError::Cancelled.is_retryable());
        let rejected = DriverError::Rejected {
            site: "hdsky".to_string(),
            status: 404,
        };
        assert!(!rejected.is_retryable());
    }
}
