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

//! qBittorrent WebUI v2 adapter.
//!
//! The only crate that knows the WebUI wire format. Implements the
//! [`trawler_core::Downloader`] contract: session login (form → SID
//! cookie), multipart torrent adds, and status lookup by hash. A 403 on any
//! call triggers one re-login and retry.

mod client;

pub use client::QbitClient;
