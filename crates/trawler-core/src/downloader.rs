//! The downloader contract.
//!
//! The core needs exactly two things from any BitTorrent client: add a
//! torrent with options and report status by hash. The adapter behind this
//! trait is the only code that knows the client's wire format.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::DownloaderResult;

/// Options accompanying a torrent add.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddTorrentOptions {
    /// Directory the payload lands in.
    pub save_path: String,
    /// Client-side category.
    pub category: Option<String>,
    /// Client-side tags.
    pub tags: Vec<String>,
    /// Whether the torrent starts paused.
    pub paused: bool,
    /// Per-torrent upload cap in bytes per second.
    pub upload_limit_bps: Option<i64>,
    /// Per-torrent download cap in bytes per second.
    pub download_limit_bps: Option<i64>,
}

/// Client-side view of a managed torrent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStatus {
    /// Info-hash the client tracks the torrent under.
    pub hash: String,
    /// Display name.
    pub name: String,
    /// Client-specific state label.
    pub state: String,
    /// Completion in the `0.0..=1.0` range.
    pub progress: f64,
}

/// Minimal client facade the engine submits through.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Establish (or refresh) the client session.
    async fn login(&self) -> DownloaderResult<()>;

    /// Add a torrent by magnet or HTTP URL; returns the info-hash when it is
    /// derivable client-side (magnet links).
    async fn add_by_url(&self, url: &str, options: &AddTorrentOptions) -> DownloaderResult<String>;

    /// Add a torrent from raw metainfo bytes; returns the info-hash derived
    /// from the payload.
    async fn add_by_file(
        &self,
        filename: &str,
        payload: Bytes,
        options: &AddTorrentOptions,
    ) -> DownloaderResult<String>;

    /// Look up a torrent by info-hash; `None` when the client does not know
    /// it.
    async fn status(&self, hash: &str) -> DownloaderResult<Option<DownloadStatus>>;
}
