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

//! Tracker-agnostic domain types and capability contracts shared across the
//! workspace: feed items, torrent details, discount levels, user profiles,
//! the site-driver and downloader traits, the shared error kinds, and the
//! fixed tracker-local clock.

pub mod clock;
pub mod downloader;
pub mod driver;
pub mod error;
pub mod model;
pub mod retry;

pub use clock::{parse_site_local, site_local_zone};
pub use downloader::{AddTorrentOptions, DownloadStatus, Downloader};
pub use driver::{SiteDriver, SubmitRequest};
pub use error::{DownloaderError, DownloaderResult, DriverError, DriverResult};
pub use model::{
    AuthMethod, DiscountLevel, FeedItem, SiteSchema, TorrentDetail, TorrentRecord, UserProfile,
};
pub use retry::RetryPolicy;
