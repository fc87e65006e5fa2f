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

//! The automation engine: rule evaluation, the per-tick ingest pipeline,
//! and the scheduler that reconciles ticker jobs against configuration
//! snapshots.

pub mod error;
pub mod ingest;
pub mod manager;
pub mod rules;
pub mod stats;

pub use error::{EngineError, EngineResult};
pub use ingest::{TickContext, TickSummary, run_tick};
pub use manager::{DriverFactory, Manager, ManagerConfig, ManagerState, run_single};
pub use rules::{Candidate, RuleSet, Verdict};
pub use stats::{UserReport, collect_user_reports};
