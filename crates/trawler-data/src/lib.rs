#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Embedded persistence layer: SQLite pool and idempotent migrations, the
//! torrent journal with its archive, per-site rate-limit checkpoints, and
//! database maintenance routines.

pub mod db;
pub mod error;
pub mod limiter;
pub mod maintenance;
pub mod torrents;

pub use db::Database;
pub use error::{DataError, DataResult};
pub use limiter::{RateLimitConfig, RateLimiterStats, SiteRateLimiter};
pub use torrents::{IngestState, TorrentStore, UpsertOutcome};
