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

//! Site definitions and drivers.
//!
//! The [`registry`] holds immutable, declarative per-site metadata (URLs,
//! auth shape, selector plans, level ladders, discount mappings). The
//! drivers supply the behaviour against that data: [`nexusphp`] scrapes the
//! HTML family, [`mtorrent`] speaks the JSON API family. Both share the
//! rate-limited, retrying HTTP plumbing in [`http`] and the feed decoding
//! in [`feed`].

pub mod driver;
pub mod feed;
pub mod http;
pub mod levels;
pub mod mtorrent;
pub mod nexusphp;
pub mod parse;
pub mod registry;

pub use driver::build_driver;
pub use registry::{Registry, SiteDefinition};
