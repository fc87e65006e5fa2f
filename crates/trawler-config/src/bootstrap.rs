//! First-run TOML import.
//!
//! The document seeds an empty database and is never consulted again; the
//! database is authoritative afterwards. Unknown keys are warned, not
//! rejected.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::warn;

use trawler_core::model::{AuthMethod, SiteSchema};

use crate::error::{ConfigError, ConfigResult};
use crate::model::{DownloaderEndpoint, GlobalSettings, RssSubscription, SiteConfig};
use crate::store::ConfigStore;

/// Outcome of a bootstrap import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    /// Number of sites seeded.
    pub sites: usize,
    /// Number of subscriptions seeded across all sites.
    pub subscriptions: usize,
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    global: GlobalSection,
    #[serde(default)]
    qbit: QbitSection,
    #[serde(default)]
    sites: BTreeMap<String, SiteSection>,
    #[serde(flatten)]
    extra: BTreeMap<String, toml::Value>,
}

#[derive(Deserialize, Default)]
struct GlobalSection {
    #[serde(default)]
    download_dir: Option<String>,
    #[serde(default)]
    default_interval_minutes: Option<u32>,
    #[serde(default)]
    enabled_default: Option<bool>,
    #[serde(default)]
    torrent_size_gb: Option<u32>,
    #[serde(default)]
    speed_limit_enabled: Option<bool>,
    #[serde(default)]
    speed_limit_mbps: Option<f64>,
    #[serde(default)]
    free_gate_hours: Option<u32>,
    #[serde(default)]
    retain_hours: Option<u32>,
    #[serde(default)]
    max_retry: Option<u32>,
    #[serde(default)]
    auto_start: Option<bool>,
    #[serde(default)]
    retire_on_discount_loss: Option<bool>,
    #[serde(flatten)]
    extra: BTreeMap<String, toml::Value>,
}

#[derive(Deserialize, Default)]
struct QbitSection {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, toml::Value>,
}

#[derive(Deserialize)]
struct SiteSection {
    name: Option<String>,
    schema: String,
    base_url: String,
    auth: String,
    #[serde(default)]
    cookie: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    rss: Vec<RssSection>,
    #[serde(flatten)]
    extra: BTreeMap<String, toml::Value>,
}

#[derive(Deserialize)]
struct RssSection {
    name: String,
    url: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    interval_minutes: Option<u32>,
    #[serde(default)]
    download_sub_path: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(flatten)]
    extra: BTreeMap<String, toml::Value>,
}

/// Parse `text` and seed the store with it.
///
/// Refused with [`ConfigError::AlreadySeeded`] once a global settings row
/// exists.
///
/// # Errors
///
/// Returns an error if the document does not parse, validation fails, or
/// persistence fails.
pub async fn import_toml(store: &ConfigStore, text: &str) -> ConfigResult<ImportSummary> {
    if store.is_seeded().await? {
        return Err(ConfigError::AlreadySeeded);
    }

    let document: Document = toml::from_str(text).map_err(|err| ConfigError::Document {
        detail: err.to_string(),
    })?;
    warn_extra("", &document.extra);
    warn_extra("global", &document.global.extra);
    warn_extra("qbit", &document.qbit.extra);

    // Build and validate everything before the first write so a rejected
    // document leaves the database unseeded.
    let global = global_from_sections(&document.global, &document.qbit);
    let mut sites = Vec::with_capacity(document.sites.len());
    for (site_id, section) in &document.sites {
        warn_extra(&format!("sites.{site_id}"), &section.extra);
        sites.push(site_from_section(site_id, section, &global)?);
    }

    store.save_global(&global).await?;
    let mut subscriptions = 0_usize;
    for site in &sites {
        subscriptions += site.subscriptions.len();
        store.upsert_site(site).await?;
    }

    Ok(ImportSummary {
        sites: sites.len(),
        subscriptions,
    })
}

fn global_from_sections(global: &GlobalSection, qbit: &QbitSection) -> GlobalSettings {
    let defaults = GlobalSettings::default();
    GlobalSettings {
        download_dir: global.download_dir.clone().unwrap_or(defaults.download_dir),
        default_interval_minutes: global
            .default_interval_minutes
            .unwrap_or(defaults.default_interval_minutes),
        enabled_default: global.enabled_default.unwrap_or(defaults.enabled_default),
        torrent_size_gb: global.torrent_size_gb.unwrap_or(defaults.torrent_size_gb),
        speed_limit_enabled: global
            .speed_limit_enabled
            .unwrap_or(defaults.speed_limit_enabled),
        speed_limit_mbps: global.speed_limit_mbps.unwrap_or(defaults.speed_limit_mbps),
        free_gate_hours: global.free_gate_hours.unwrap_or(defaults.free_gate_hours),
        retain_hours: global.retain_hours.unwrap_or(defaults.retain_hours),
        max_retry: global.max_retry.unwrap_or(defaults.max_retry),
        auto_start: global.auto_start.unwrap_or(defaults.auto_start),
        retire_on_discount_loss: global
            .retire_on_discount_loss
            .unwrap_or(defaults.retire_on_discount_loss),
        downloader: DownloaderEndpoint {
            url: qbit.url.clone().unwrap_or_default(),
            username: qbit.username.clone().unwrap_or_default(),
            password: qbit.password.clone().unwrap_or_default(),
        },
    }
}

fn site_from_section(
    site_id: &str,
    section: &SiteSection,
    global: &GlobalSettings,
) -> ConfigResult<SiteConfig> {
    let schema: SiteSchema = section.schema.parse().map_err(|err| {
        ConfigError::invalid(format!("sites.{site_id}"), "schema", format!("{err}"))
    })?;
    let auth = match section.auth.as_str() {
        "cookie" => AuthMethod::Cookie {
            cookie: section.cookie.clone().unwrap_or_default(),
        },
        "api_key" => AuthMethod::ApiKey {
            key: section.api_key.clone().unwrap_or_default(),
            api_url: section.api_url.clone().unwrap_or_default(),
        },
        other => {
            return Err(ConfigError::invalid(
                format!("sites.{site_id}"),
                "auth",
                format!("expected 'cookie' or 'api_key', got '{other}'"),
            ));
        }
    };

    let subscriptions = section
        .rss
        .iter()
        .map(|rss| {
            warn_extra(&format!("sites.{site_id}.rss.{}", rss.name), &rss.extra);
            RssSubscription {
                name: rss.name.clone(),
                url: rss.url.clone(),
                category: rss.category.clone(),
                tag: rss.tag.clone(),
                interval_minutes: rss.interval_minutes.unwrap_or(0),
                download_sub_path: rss.download_sub_path.clone().unwrap_or_default(),
                enabled: rss.enabled.unwrap_or(global.enabled_default),
            }
        })
        .collect();

    Ok(SiteConfig {
        site_id: site_id.to_string(),
        display_name: section.name.clone().unwrap_or_else(|| site_id.to_string()),
        schema,
        base_url: section.base_url.clone(),
        auth,
        enabled: section.enabled.unwrap_or(global.enabled_default),
        subscriptions,
    })
}

fn warn_extra(section: &str, extra: &BTreeMap<String, toml::Value>) {
    for key in extra.keys() {
        if section.is_empty() {
            warn!(key = %key, "ignoring unknown configuration key");
        } else {
            warn!(section = %section, key = %key, "ignoring unknown configuration key");
        }
    }
}

/// Commented default document written by `config init`.
#[must_use]
pub const fn default_document() -> &'static str {
    r#"# Trawler bootstrap configuration.
# Imported once into the database; afterwards the database is authoritative.

[global]
download_dir = "/downloads"
default_interval_minutes = 10
torrent_size_gb = 500
free_gate_hours = 1
retain_hours = 72
max_retry = 3
auto_start = false
speed_limit_enabled = false
speed_limit_mbps = 0.0

[qbit]
url = "http://127.0.0.1:8080"
username = "admin"
password = "adminadmin"

# One section per tracker site. `auth` is "cookie" or "api_key".
#
# [sites.hdsky]
# name = "HDSky"
# schema = "nexusphp"
# base_url = "https://hdsky.me"
# auth = "cookie"
# cookie = "uid=...; pass=..."
# enabled = true
#
# [[sites.hdsky.rss]]
# name = "movies"
# url = "https://hdsky.me/torrentrss.php?rows=50"
# category = "movies"
# tag = "trawler"
# interval_minutes = 5
# download_sub_path = "hdsky/"
# enabled = true
#
# [sites.mteam]
# name = "M-Team"
# schema = "mtorrent"
# base_url = "https://kp.m-team.cc"
# auth = "api_key"
# api_key = "..."
# api_url = "https://api.m-team.cc/api"
#
# [[sites.mteam.rss]]
# name = "adult"
# url = "https://rss.m-team.cc/api/rss/fetch?..."
# download_sub_path = "mteam/"
"#
}
