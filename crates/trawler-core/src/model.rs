//! Domain data carriers shared by the drivers, the stores, and the engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Promotion level a tracker grants a torrent during its discount window.
///
/// The level decides the ratio at which download is charged and upload is
/// credited while the window is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscountLevel {
    /// Download is not charged at all.
    Free,
    /// Download is not charged and upload is credited twice.
    DoubleFree,
    /// Upload is credited twice; download is charged normally.
    DoubleUp,
    /// Download is charged at 30% of the payload size.
    Percent30,
    /// Download is charged at half the payload size.
    Percent50,
    /// Half download charge combined with doubled upload credit.
    DoublePercent50,
    /// No promotion is active.
    #[default]
    None,
}

impl DiscountLevel {
    /// Whether downloading under this level is free of download charge.
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free | Self::DoubleFree)
    }

    /// Stable textual tag used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::DoubleFree => "double_free",
            Self::DoubleUp => "double_up",
            Self::Percent30 => "percent_30",
            Self::Percent50 => "percent_50",
            Self::DoublePercent50 => "double_percent_50",
            Self::None => "none",
        }
    }
}

impl FromStr for DiscountLevel {
    type Err = UnknownTag;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "free" => Ok(Self::Free),
            "double_free" => Ok(Self::DoubleFree),
            "double_up" => Ok(Self::DoubleUp),
            "percent_30" => Ok(Self::Percent30),
            "percent_50" => Ok(Self::Percent50),
            "double_percent_50" => Ok(Self::DoublePercent50),
            "none" => Ok(Self::None),
            other => Err(UnknownTag {
                kind: "discount level",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DiscountLevel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Tracker software family a site definition targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteSchema {
    /// The NexusPHP HTML family.
    NexusPhp,
    /// Unit3D sites (HTML, NexusPHP-adjacent markup).
    Unit3d,
    /// Gazelle sites.
    Gazelle,
    /// The mTorrent JSON API family.
    MTorrent,
    /// HDDolby, a NexusPHP dialect with its own discount markup.
    HdDolby,
    /// Rousi, a NexusPHP dialect.
    Rousi,
}

impl SiteSchema {
    /// Stable textual tag used for persistence and the bootstrap document.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NexusPhp => "nexusphp",
            Self::Unit3d => "unit3d",
            Self::Gazelle => "gazelle",
            Self::MTorrent => "mtorrent",
            Self::HdDolby => "hddolby",
            Self::Rousi => "rousi",
        }
    }

    /// Whether detail/user pages are HTML scraped rather than JSON.
    #[must_use]
    pub const fn is_html(self) -> bool {
        !matches!(self, Self::MTorrent)
    }
}

impl FromStr for SiteSchema {
    type Err = UnknownTag;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "nexusphp" => Ok(Self::NexusPhp),
            "unit3d" => Ok(Self::Unit3d),
            "gazelle" => Ok(Self::Gazelle),
            "mtorrent" => Ok(Self::MTorrent),
            "hddolby" => Ok(Self::HdDolby),
            "rousi" => Ok(Self::Rousi),
            other => Err(UnknownTag {
                kind: "site schema",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SiteSchema {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// How outbound requests to a site are authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    /// A raw `Cookie` header value captured from a browser session.
    Cookie {
        /// Cookie header payload.
        cookie: String,
    },
    /// An API key sent as `x-api-key`, with a dedicated API base URL.
    ApiKey {
        /// Key material.
        key: String,
        /// Base URL of the JSON API.
        api_url: String,
    },
}

/// A candidate torrent observed in an RSS feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    /// Site-scoped identifier of the torrent (guid or numeric id).
    pub id: String,
    /// Display title.
    pub title: String,
    /// Detail page URL.
    pub page_url: Option<String>,
    /// Direct `.torrent` download URL when the feed exposes one.
    pub download_url: Option<String>,
    /// Feed category label.
    pub category: Option<String>,
    /// Payload size when the feed exposes one.
    pub size_mb: Option<u64>,
    /// Publication instant when the feed exposes one.
    pub published_at: Option<DateTime<Utc>>,
    /// Detail data carried inline by API feeds; when present,
    /// [`crate::SiteDriver::resolve_detail`] is a no-op.
    pub detail: Option<TorrentDetail>,
}

/// Promotion facts resolved from a detail page or API payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TorrentDetail {
    /// Active promotion level.
    pub discount: DiscountLevel,
    /// Absolute instant the promotion expires, when bounded.
    pub free_end_time: Option<DateTime<Utc>>,
    /// Whether the torrent carries a hit-and-run obligation.
    pub has_hr: bool,
    /// Payload size in mebibytes.
    pub size_mb: u64,
}

/// Lifecycle row for an observed torrent, keyed by `(site_id, torrent_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentRecord {
    /// Owning site identifier.
    pub site_id: String,
    /// Site-scoped torrent identifier.
    pub torrent_id: String,
    /// Display title.
    pub title: String,
    /// Subscription the torrent was observed through.
    pub subscription: String,
    /// Feed category label.
    pub category: Option<String>,
    /// User tag propagated to the downloader.
    pub tag: Option<String>,
    /// Direct `.torrent` download URL.
    pub download_url: String,
    /// Payload size in mebibytes.
    pub size_mb: u64,
    /// Promotion level at last observation.
    pub discount: DiscountLevel,
    /// Absolute promotion deadline, when bounded.
    pub free_end_time: Option<DateTime<Utc>>,
    /// Whether the torrent carries a hit-and-run obligation.
    pub has_hr: bool,
    /// Instant of first observation.
    pub first_seen: DateTime<Utc>,
    /// Instant of most recent observation.
    pub last_seen: DateTime<Utc>,
    /// Whether the record was handed to the downloader.
    pub submitted: bool,
    /// Instant of successful submission.
    pub submitted_at: Option<DateTime<Utc>>,
    /// Info-hash acknowledged by the downloader.
    pub downloader_hash: Option<String>,
    /// Save path the record was submitted with.
    pub save_path: Option<String>,
    /// Most recent submission error.
    pub last_error: Option<String>,
    /// Number of failed submission attempts.
    pub failure_count: u32,
    /// Claim sentinel; a live claim grants exclusive submission rights.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl TorrentRecord {
    /// Seed a fresh record from a feed item and its resolved detail.
    #[must_use]
    pub fn from_observation(
        site_id: &str,
        subscription: &str,
        tag: Option<&str>,
        item: &FeedItem,
        detail: &TorrentDetail,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            site_id: site_id.to_string(),
            torrent_id: item.id.clone(),
            title: item.title.clone(),
            subscription: subscription.to_string(),
            category: item.category.clone(),
            tag: tag.map(str::to_string),
            download_url: item.download_url.clone().unwrap_or_default(),
            size_mb: detail.size_mb,
            discount: detail.discount,
            free_end_time: detail.free_end_time,
            has_hr: detail.has_hr,
            first_seen: now,
            last_seen: now,
            submitted: false,
            submitted_at: None,
            downloader_hash: None,
            save_path: None,
            last_error: None,
            failure_count: 0,
            claimed_at: None,
        }
    }

    /// Remaining free window at `now`, if the promotion is bounded.
    #[must_use]
    pub fn free_remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.free_end_time.map(|end| end - now)
    }
}

/// Normalised per-site user statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserProfile {
    /// Account name.
    pub username: String,
    /// Lifetime upload in bytes.
    pub uploaded_bytes: u64,
    /// Lifetime download in bytes.
    pub downloaded_bytes: u64,
    /// Share ratio as reported or derived.
    pub ratio: f64,
    /// Bonus point balance.
    pub bonus: f64,
    /// Seeding bonus balance, where the site tracks one separately.
    pub seeding_bonus: f64,
    /// Bonus accrual rate per hour.
    pub bonus_per_hour: f64,
    /// Number of actively seeded torrents.
    pub seeding: u64,
    /// Total size of actively seeded payloads in bytes.
    pub seeding_size_bytes: u64,
    /// Ladder position resolved from the site's level rules.
    pub level_id: u32,
    /// Display name of the resolved level.
    pub level_name: String,
    /// Account creation instant.
    pub join_date: Option<DateTime<Utc>>,
    /// Most recent activity instant.
    pub last_access: Option<DateTime<Utc>>,
}

/// Error for persistence tags that no longer map to a known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} tag '{value}'")]
pub struct UnknownTag {
    /// Which tag family failed to parse.
    pub kind: &'static str,
    /// Offending value.
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discount_round_trips_through_persistence_tag() {
        for level in [
            DiscountLevel::Free,
            DiscountLevel::DoubleFree,
            DiscountLevel::DoubleUp,
            DiscountLevel::Percent30,
            DiscountLevel::Percent50,
            DiscountLevel::DoublePercent50,
            DiscountLevel::None,
        ] {
            let parsed: DiscountLevel = level.as_str().parse().expect("tag should round-trip");
            assert_eq!(parsed, level);
        }
        assert!("2xfree".parse::<DiscountLevel>().is_err());
    }

    #[test]
    fn only_full_free_levels_count_as_free() {
        assert!(DiscountLevel::Free.is_free());
        assert!(DiscountLevel::DoubleFree.is_free());
        assert!(!DiscountLevel::DoubleUp.is_free());
        assert!(!DiscountLevel::Percent50.is_free());
        assert!(!DiscountLevel::None.is_free());
    }

    #[test]
    fn record_seeds_observation_timestamps() {
        let now = Utc::now();
        let item = FeedItem {
            id: "guid-1".to_string(),
            title: "M1".to_string(),
            page_url: None,
            download_url: Some("https://tracker.example/download/1".to_string()),
            category: Some("movies".to_string()),
            size_mb: Some(64),
            published_at: None,
            detail: None,
        };
        let detail = TorrentDetail {
            discount: DiscountLevel::Free,
            free_end_time: Some(now + chrono::Duration::hours(2)),
            has_hr: false,
            size_mb: 64,
        };

        let record = TorrentRecord::from_observation("hdsky", "R1", Some("auto"), &item, &detail, now);
        assert_eq!(record.first_seen, now);
        assert_eq!(record.last_seen, now);
        assert!(!record.submitted);
        assert_eq!(record.failure_count, 0);
        let remaining = record.free_remaining(now).expect("bounded window");
        assert_eq!(remaining, chrono::Duration::hours(2));
    }
}
