//! The site-driver capability contract.
//!
//! A driver owns everything site-specific: credential attachment, rate-limit
//! discipline, retry policy, and the parsing of feeds, detail pages, and
//! user-info pages. The engine only ever sees this trait.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::DriverResult;
use crate::model::{FeedItem, TorrentDetail, TorrentRecord, UserProfile};

/// Parameters for handing a claimed record to the downloader.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Site-scoped torrent identifier, for drivers that mint download
    /// tokens instead of exposing stable URLs.
    pub torrent_id: String,
    /// Display title, used for the metainfo filename.
    pub title: String,
    /// Direct `.torrent` download URL; may be empty for token-minting
    /// sites.
    pub download_url: String,
    /// Absolute save path (download root joined with the subscription
    /// sub-path).
    pub save_path: String,
    /// Downloader category.
    pub category: Option<String>,
    /// Downloader tags.
    pub tags: Vec<String>,
    /// Whether the torrent starts paused.
    pub paused: bool,
    /// Per-torrent upload cap in bytes per second.
    pub upload_limit_bps: Option<i64>,
    /// Per-torrent download cap in bytes per second.
    pub download_limit_bps: Option<i64>,
}

impl SubmitRequest {
    /// Build a request for `record` targeting `save_path`.
    #[must_use]
    pub fn for_record(record: &TorrentRecord, save_path: impl Into<String>) -> Self {
        Self {
            torrent_id: record.torrent_id.clone(),
            title: record.title.clone(),
            download_url: record.download_url.clone(),
            save_path: save_path.into(),
            category: record.category.clone(),
            tags: record.tag.iter().cloned().collect(),
            paused: false,
            upload_limit_bps: None,
            download_limit_bps: None,
        }
    }
}

/// Capability set every site implementation must provide.
#[async_trait]
pub trait SiteDriver: Send + Sync {
    /// Stable identifier of the site this driver serves.
    fn site_id(&self) -> &str;

    /// Whether the site is currently enabled in configuration.
    fn enabled(&self) -> bool {
        true
    }

    /// Retry budget for transient failures.
    fn max_retries(&self) -> u32 {
        3
    }

    /// Base delay before the first retry.
    fn retry_delay(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Fetch and parse one RSS feed into candidate items, preserving feed
    /// order.
    async fn fetch_rss(&self, cancel: &CancellationToken, url: &str)
    -> DriverResult<Vec<FeedItem>>;

    /// Resolve promotion facts for an item. A no-op returning the inline
    /// payload when the feed already carried detail data.
    async fn resolve_detail(
        &self,
        cancel: &CancellationToken,
        item: &FeedItem,
    ) -> DriverResult<TorrentDetail>;

    /// Download the raw `.torrent` metainfo bytes for a record.
    async fn download_torrent(
        &self,
        cancel: &CancellationToken,
        download_url: &str,
    ) -> DriverResult<bytes::Bytes>;

    /// Download the metainfo and hand it to the downloader; returns the
    /// acknowledged info-hash.
    async fn submit_to_downloader(
        &self,
        cancel: &CancellationToken,
        request: &SubmitRequest,
    ) -> DriverResult<String>;

    /// Fetch and normalise the account's statistics.
    async fn fetch_user_info(&self, cancel: &CancellationToken) -> DriverResult<UserProfile>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiscountLevel;
    use chrono::Utc;

    #[test]
    fn submit_request_carries_record_tag_as_downloader_tag() {
        let now = Utc::now();
        let record = TorrentRecord {
            site_id: "hdsky".to_string(),
            torrent_id: "42".to_string(),
            title: "M1".to_string(),
            subscription: "R1".to_string(),
            category: Some("movies".to_string()),
            tag: Some("auto".to_string()),
            download_url: "https://tracker.example/download/42".to_string(),
            size_mb: 64,
            discount: DiscountLevel::Free,
            free_end_time: None,
            has_hr: false,
            first_seen: now,
            last_seen: now,
            submitted: false,
            submitted_at: None,
            downloader_hash: None,
            save_path: None,
            last_error: None,
            failure_count: 0,
            claimed_at: None,
        };

        let request = SubmitRequest::for_record(&record, "/downloads/hdsky");
        assert_eq!(request.save_path, "/downloads/hdsky");
        assert_eq!(request.tags, vec!["auto".to_string()]);
        assert_eq!(request.category.as_deref(), Some("movies"));
        assert!(!request.paused);
    }
}
