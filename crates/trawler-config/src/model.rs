//! Typed configuration entities and the immutable snapshot handed to the
//! scheduler.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use trawler_core::model::{AuthMethod, SiteSchema, UnknownTag};

/// Fallback tick interval when neither the subscription nor the global
/// default carries one.
pub const FALLBACK_INTERVAL_MINUTES: u32 = 10;

/// Singleton global settings row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Root directory submitted save paths are rooted in.
    pub download_dir: String,
    /// Default tick interval in minutes; must be positive.
    pub default_interval_minutes: u32,
    /// Default enabled flag applied to new entities.
    pub enabled_default: bool,
    /// Size ceiling in gibibytes; larger torrents are skipped.
    pub torrent_size_gb: u32,
    /// Whether the informational speed limit is passed to the downloader.
    pub speed_limit_enabled: bool,
    /// Speed limit value in MB/s.
    pub speed_limit_mbps: f64,
    /// Minimum remaining free window, in hours, to accept a torrent.
    pub free_gate_hours: u32,
    /// Hours completed or inactive records stay live before archival.
    pub retain_hours: u32,
    /// Submission attempts before a record is abandoned.
    pub max_retry: u32,
    /// Whether the scheduler starts jobs on boot.
    pub auto_start: bool,
    /// Retire a live record immediately when its promotion is withdrawn.
    pub retire_on_discount_loss: bool,
    /// Downloader endpoint and credentials.
    pub downloader: DownloaderEndpoint,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            download_dir: String::new(),
            default_interval_minutes: FALLBACK_INTERVAL_MINUTES,
            enabled_default: true,
            torrent_size_gb: 500,
            speed_limit_enabled: false,
            speed_limit_mbps: 0.0,
            free_gate_hours: 1,
            retain_hours: 72,
            max_retry: 3,
            auto_start: false,
            retire_on_discount_loss: true,
            downloader: DownloaderEndpoint::default(),
        }
    }
}

/// qBittorrent WebUI endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DownloaderEndpoint {
    /// WebUI base URL.
    pub url: String,
    /// WebUI account name.
    pub username: String,
    /// WebUI account password.
    pub password: String,
}

/// One configured tracker site with its subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Stable identifier, e.g. `mteam` or `hdsky`.
    pub site_id: String,
    /// Display name.
    pub display_name: String,
    /// Tracker software family.
    pub schema: SiteSchema,
    /// Site base URL.
    pub base_url: String,
    /// Credential shape and payload.
    pub auth: AuthMethod,
    /// Whether the site participates in scheduling.
    pub enabled: bool,
    /// RSS subscriptions, names unique within the site.
    pub subscriptions: Vec<RssSubscription>,
}

/// A named RSS feed with its own cadence and save path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RssSubscription {
    /// Name, unique within the owning site.
    pub name: String,
    /// Feed URL.
    pub url: String,
    /// Category label attached to persisted records.
    pub category: Option<String>,
    /// User tag propagated to the downloader.
    pub tag: Option<String>,
    /// Tick interval in minutes; `0` inherits the global default.
    pub interval_minutes: u32,
    /// Sub-path appended to the global download directory.
    pub download_sub_path: String,
    /// Whether the subscription is scheduled.
    pub enabled: bool,
}

impl RssSubscription {
    /// Effective tick interval, falling back to the global default and the
    /// built-in floor.
    #[must_use]
    pub fn effective_interval(&self, global: &GlobalSettings) -> Duration {
        let minutes = if self.interval_minutes > 0 {
            self.interval_minutes
        } else if global.default_interval_minutes > 0 {
            global.default_interval_minutes
        } else {
            FALLBACK_INTERVAL_MINUTES
        };
        Duration::from_secs(u64::from(minutes) * 60)
    }
}

/// How a filter rule's pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Case-insensitive substring.
    Keyword,
    /// Anchored glob with `*` and `?`.
    Wildcard,
    /// Full-match regular expression.
    Regex,
}

impl PatternType {
    /// Stable textual tag used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Wildcard => "wildcard",
            Self::Regex => "regex",
        }
    }
}

impl FromStr for PatternType {
    type Err = UnknownTag;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "keyword" => Ok(Self::Keyword),
            "wildcard" => Ok(Self::Wildcard),
            "regex" => Ok(Self::Regex),
            other => Err(UnknownTag {
                kind: "pattern type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Which candidate fields a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    /// The candidate title.
    Title,
    /// The candidate tag.
    Tag,
    /// Either field.
    Both,
}

impl MatchField {
    /// Stable textual tag used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Tag => "tag",
            Self::Both => "both",
        }
    }
}

impl FromStr for MatchField {
    type Err = UnknownTag;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "title" => Ok(Self::Title),
            "tag" => Ok(Self::Tag),
            "both" => Ok(Self::Both),
            other => Err(UnknownTag {
                kind: "match field",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for MatchField {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One ordered filter rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Database identifier; `0` for rules not yet persisted.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Pattern text.
    pub pattern: String,
    /// Pattern interpretation.
    pub pattern_type: PatternType,
    /// Fields the pattern applies to.
    pub match_field: MatchField,
    /// Accept only when the candidate is free at match time.
    pub require_free: bool,
    /// Restrict the rule to one site; `None` matches every site.
    pub scope_site: Option<String>,
    /// Restrict the rule to one subscription; `None` matches every feed.
    pub scope_rss: Option<String>,
    /// Whether the rule participates in evaluation.
    pub enabled: bool,
    /// Evaluation order, ascending.
    pub priority: i32,
}

/// Immutable configuration snapshot handed to the scheduler. The store
/// never mutates an emitted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Global settings.
    pub global: GlobalSettings,
    /// Configured sites with their subscriptions.
    pub sites: Vec<SiteConfig>,
    /// Filter rules in evaluation order (priority asc, id asc).
    pub rules: Vec<FilterRule>,
}

impl ConfigSnapshot {
    /// Find a site by identifier.
    #[must_use]
    pub fn site(&self, site_id: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|site| site.site_id == site_id)
    }
}
