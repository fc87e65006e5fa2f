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

//! Database-backed configuration facade.
//!
//! Layout: `model.rs` (typed configuration entities and the immutable
//! snapshot), `store.rs` (the `ConfigStore` mutators and snapshot loader),
//! `bootstrap.rs` (TOML import for first-run seeding), `error.rs`
//! (`ConfigError`). The TOML document is bootstrap-only; once seeded, the
//! database is authoritative.

pub mod bootstrap;
pub mod error;
pub mod model;
pub mod store;

pub use error::{ConfigError, ConfigResult};
pub use model::{
    ConfigSnapshot, DownloaderEndpoint, FilterRule, GlobalSettings, MatchField, PatternType,
    RssSubscription, SiteConfig,
};
pub use store::ConfigStore;
