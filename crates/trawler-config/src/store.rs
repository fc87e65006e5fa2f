//! The `ConfigStore`: durable, reloadable configuration rows.
//!
//! Readers may run concurrently; every mutator runs inside one transaction
//! and bumps `updated_at`. A failed mutation leaves the caller holding its
//! last valid snapshot.

use chrono::Utc;
use sqlx::{FromRow, SqliteConnection};
use tracing::debug;
use url::Url;

use trawler_core::model::{AuthMethod, SiteSchema};
use trawler_data::Database;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{
    ConfigSnapshot, DownloaderEndpoint, FilterRule, GlobalSettings, MatchField, PatternType,
    RssSubscription, SiteConfig,
};

/// Database-backed configuration facade.
#[derive(Clone)]
pub struct ConfigStore {
    db: Database,
}

#[derive(FromRow)]
struct GlobalRow {
    download_dir: String,
    default_interval_minutes: i64,
    enabled_default: bool,
    torrent_size_gb: i64,
    speed_limit_enabled: bool,
    speed_limit_mbps: f64,
    free_gate_hours: i64,
    retain_hours: i64,
    max_retry: i64,
    auto_start: bool,
    retire_on_discount_loss: bool,
    qbit_url: String,
    qbit_username: String,
    qbit_password: String,
}

impl From<GlobalRow> for GlobalSettings {
    fn from(row: GlobalRow) -> Self {
        Self {
            download_dir: row.download_dir,
            default_interval_minutes: u32::try_from(row.default_interval_minutes)
                .unwrap_or_default(),
            enabled_default: row.enabled_default,
            torrent_size_gb: u32::try_from(row.torrent_size_gb).unwrap_or_default(),
            speed_limit_enabled: row.speed_limit_enabled,
            speed_limit_mbps: row.speed_limit_mbps,
            free_gate_hours: u32::try_from(row.free_gate_hours).unwrap_or_default(),
            retain_hours: u32::try_from(row.retain_hours).unwrap_or_default(),
            max_retry: u32::try_from(row.max_retry).unwrap_or_default(),
            auto_start: row.auto_start,
            retire_on_discount_loss: row.retire_on_discount_loss,
            downloader: DownloaderEndpoint {
                url: row.qbit_url,
                username: row.qbit_username,
                password: row.qbit_password,
            },
        }
    }
}

#[derive(FromRow)]
struct SiteRow {
    site_id: String,
    display_name: String,
    schema_tag: String,
    base_url: String,
    auth_method: String,
    cookie: Option<String>,
    api_key: Option<String>,
    api_url: Option<String>,
    enabled: bool,
}

#[derive(FromRow)]
struct SubscriptionRow {
    site_id: String,
    name: String,
    url: String,
    category: Option<String>,
    tag: Option<String>,
    interval_minutes: i64,
    download_sub_path: String,
    enabled: bool,
}

#[derive(FromRow)]
struct RuleRow {
    id: i64,
    name: String,
    pattern: String,
    pattern_type: String,
    match_field: String,
    require_free: bool,
    scope_site: Option<String>,
    scope_rss: Option<String>,
    enabled: bool,
    priority: i64,
}

impl ConfigStore {
    /// Wrap the shared database handle.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Whether the database has been seeded with a global settings row.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub async fn is_seeded(&self) -> ConfigResult<bool> {
        let present: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settings_global WHERE id = 1")
            .fetch_one(self.db.pool())
            .await
            .map_err(|source| trawler_data::DataError::Query {
                operation: "config.is_seeded",
                source,
            })?;
        Ok(present > 0)
    }

    /// Read the global settings, seeding defaults on first access.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or the default seed fails.
    pub async fn global(&self) -> ConfigResult<GlobalSettings> {
        if !self.is_seeded().await? {
            self.save_global(&GlobalSettings::default()).await?;
        }
        let row = sqlx::query_as::<_, GlobalRow>(
            "SELECT download_dir, default_interval_minutes, enabled_default, torrent_size_gb, \
             speed_limit_enabled, speed_limit_mbps, free_gate_hours, retain_hours, max_retry, \
             auto_start, retire_on_discount_loss, qbit_url, qbit_username, qbit_password \
             FROM settings_global WHERE id = 1",
        )
        .fetch_one(self.db.pool())
        .await
        .map_err(|source| trawler_data::DataError::Query {
            operation: "config.global",
            source,
        })?;
        Ok(row.into())
    }

    /// Persist the global settings row, bumping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] on validation failure or a data
    /// error if the write fails.
    pub async fn save_global(&self, settings: &GlobalSettings) -> ConfigResult<()> {
        validate_global(settings)?;
        sqlx::query(
            "INSERT INTO settings_global (id, download_dir, default_interval_minutes, \
             enabled_default, torrent_size_gb, speed_limit_enabled, speed_limit_mbps, \
             free_gate_hours, retain_hours, max_retry, auto_start, retire_on_discount_loss, \
             qbit_url, qbit_username, qbit_password, updated_at) \
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
             ON CONFLICT (id) DO UPDATE SET download_dir = excluded.download_dir, \
             default_interval_minutes = excluded.default_interval_minutes, \
             enabled_default = excluded.enabled_default, \
             torrent_size_gb = excluded.torrent_size_gb, \
             speed_limit_enabled = excluded.speed_limit_enabled, \
             speed_limit_mbps = excluded.speed_limit_mbps, \
             free_gate_hours = excluded.free_gate_hours, \
             retain_hours = excluded.retain_hours, max_retry = excluded.max_retry, \
             auto_start = excluded.auto_start, \
             retire_on_discount_loss = excluded.retire_on_discount_loss, \
             qbit_url = excluded.qbit_url, qbit_username = excluded.qbit_username, \
             qbit_password = excluded.qbit_password, updated_at = excluded.updated_at",
        )
        .bind(&settings.download_dir)
        .bind(i64::from(settings.default_interval_minutes))
        .bind(settings.enabled_default)
        .bind(i64::from(settings.torrent_size_gb))
        .bind(settings.speed_limit_enabled)
        .bind(settings.speed_limit_mbps)
        .bind(i64::from(settings.free_gate_hours))
        .bind(i64::from(settings.retain_hours))
        .bind(i64::from(settings.max_retry))
        .bind(settings.auto_start)
        .bind(settings.retire_on_discount_loss)
        .bind(&settings.downloader.url)
        .bind(&settings.downloader.username)
        .bind(&settings.downloader.password)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await
        .map_err(|source| trawler_data::DataError::Query {
            operation: "config.save_global",
            source,
        })?;
        Ok(())
    }

    /// Insert or replace a site together with its subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] on validation failure or a data
    /// error if the transaction fails.
    pub async fn upsert_site(&self, site: &SiteConfig) -> ConfigResult<()> {
        validate_site(site)?;
        let mut tx =
            self.db.pool().begin().await.map_err(|source| {
                trawler_data::DataError::Query {
                    operation: "config.upsert_site",
                    source,
                }
            })?;

        let (auth_method, cookie, api_key, api_url) = match &site.auth {
            AuthMethod::Cookie { cookie } => ("cookie", Some(cookie.clone()), None, None),
            AuthMethod::ApiKey { key, api_url } => {
                ("api_key", None, Some(key.clone()), Some(api_url.clone()))
            }
        };

        sqlx::query(
            "INSERT INTO sites (site_id, display_name, schema_tag, base_url, auth_method, \
             cookie, api_key, api_url, enabled, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT (site_id) DO UPDATE SET display_name = excluded.display_name, \
             schema_tag = excluded.schema_tag, base_url = excluded.base_url, \
             auth_method = excluded.auth_method, cookie = excluded.cookie, \
             api_key = excluded.api_key, api_url = excluded.api_url, \
             enabled = excluded.enabled, updated_at = excluded.updated_at",
        )
        .bind(&site.site_id)
        .bind(&site.display_name)
        .bind(site.schema.as_str())
        .bind(&site.base_url)
        .bind(auth_method)
        .bind(cookie)
        .bind(api_key)
        .bind(api_url)
        .bind(site.enabled)
        .bind(Utc::now())
        .execute(tx.as_mut())
        .await
        .map_err(|source| trawler_data::DataError::Query {
            operation: "config.upsert_site",
            source,
        })?;

        sqlx::query("DELETE FROM rss_subscriptions WHERE site_id = ?1")
            .bind(&site.site_id)
            .execute(tx.as_mut())
            .await
            .map_err(|source| trawler_data::DataError::Query {
                operation: "config.upsert_site",
                source,
            })?;
        for subscription in &site.subscriptions {
            insert_subscription(tx.as_mut(), &site.site_id, subscription).await?;
        }

        tx.commit().await.map_err(|source| {
            trawler_data::DataError::Query {
                operation: "config.upsert_site",
                source,
            }
        })?;
        debug!(site = %site.site_id, subscriptions = site.subscriptions.len(), "site saved");
        Ok(())
    }

    /// Remove a site and (via cascade) its subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unknown`] when the site does not exist.
    pub async fn delete_site(&self, site_id: &str) -> ConfigResult<()> {
        let deleted = sqlx::query("DELETE FROM sites WHERE site_id = ?1")
            .bind(site_id)
            .execute(self.db.pool())
            .await
            .map_err(|source| trawler_data::DataError::Query {
                operation: "config.delete_site",
                source,
            })?;
        if deleted.rows_affected() == 0 {
            return Err(ConfigError::Unknown {
                kind: "site",
                name: site_id.to_string(),
            });
        }
        Ok(())
    }

    /// Insert or replace a filter rule; returns its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] on validation failure or a data
    /// error if the write fails.
    pub async fn upsert_rule(&self, rule: &FilterRule) -> ConfigResult<i64> {
        validate_rule(rule)?;
        if rule.id == 0 {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO filter_rules (name, pattern, pattern_type, match_field, \
                 require_free, scope_site, scope_rss, enabled, priority, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) RETURNING id",
            )
            .bind(&rule.name)
            .bind(&rule.pattern)
            .bind(rule.pattern_type.as_str())
            .bind(rule.match_field.as_str())
            .bind(rule.require_free)
            .bind(&rule.scope_site)
            .bind(&rule.scope_rss)
            .bind(rule.enabled)
            .bind(i64::from(rule.priority))
            .bind(Utc::now())
            .fetch_one(self.db.pool())
            .await
            .map_err(|source| trawler_data::DataError::Query {
                operation: "config.upsert_rule",
                source,
            })?;
            return Ok(id);
        }

        sqlx::query(
            "UPDATE filter_rules SET name = ?2, pattern = ?3, pattern_type = ?4, \
             match_field = ?5, require_free = ?6, scope_site = ?7, scope_rss = ?8, \
             enabled = ?9, priority = ?10, updated_at = ?11 WHERE id = ?1",
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.pattern)
        .bind(rule.pattern_type.as_str())
        .bind(rule.match_field.as_str())
        .bind(rule.require_free)
        .bind(&rule.scope_site)
        .bind(&rule.scope_rss)
        .bind(rule.enabled)
        .bind(i64::from(rule.priority))
        .bind(Utc::now())
        .execute(self.db.pool())
        .await
        .map_err(|source| trawler_data::DataError::Query {
            operation: "config.upsert_rule",
            source,
        })?;
        Ok(rule.id)
    }

    /// Delete a filter rule.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unknown`] when the rule does not exist.
    pub async fn delete_rule(&self, id: i64) -> ConfigResult<()> {
        let deleted = sqlx::query("DELETE FROM filter_rules WHERE id = ?1")
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|source| trawler_data::DataError::Query {
                operation: "config.delete_rule",
                source,
            })?;
        if deleted.rows_affected() == 0 {
            return Err(ConfigError::Unknown {
                kind: "rule",
                name: id.to_string(),
            });
        }
        Ok(())
    }

    /// List configured sites with their subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an error if a read fails or a stored tag is corrupt.
    pub async fn list_sites(&self) -> ConfigResult<Vec<SiteConfig>> {
        let site_rows = sqlx::query_as::<_, SiteRow>(
            "SELECT site_id, display_name, schema_tag, base_url, auth_method, cookie, \
             api_key, api_url, enabled FROM sites ORDER BY site_id ASC",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|source| trawler_data::DataError::Query {
            operation: "config.list_sites",
            source,
        })?;

        let subscription_rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT site_id, name, url, category, tag, interval_minutes, download_sub_path, \
             enabled FROM rss_subscriptions ORDER BY site_id ASC, name ASC",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|source| trawler_data::DataError::Query {
            operation: "config.list_sites",
            source,
        })?;

        let mut sites = Vec::with_capacity(site_rows.len());
        for row in site_rows {
            sites.push(site_from_row(row)?);
        }
        for row in subscription_rows {
            if let Some(site) = sites
                .iter_mut()
                .find(|site| site.site_id == row.site_id)
            {
                site.subscriptions.push(RssSubscription {
                    name: row.name,
                    url: row.url,
                    category: row.category,
                    tag: row.tag,
                    interval_minutes: u32::try_from(row.interval_minutes).unwrap_or_default(),
                    download_sub_path: row.download_sub_path,
                    enabled: row.enabled,
                });
            }
        }
        Ok(sites)
    }

    /// List filter rules in evaluation order (priority asc, id asc).
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or a stored tag is corrupt.
    pub async fn list_rules(&self) -> ConfigResult<Vec<FilterRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT id, name, pattern, pattern_type, match_field, require_free, scope_site, \
             scope_rss, enabled, priority FROM filter_rules \
             ORDER BY priority ASC, id ASC",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|source| trawler_data::DataError::Query {
            operation: "config.list_rules",
            source,
        })?;

        rows.into_iter().map(rule_from_row).collect()
    }

    /// Produce an immutable snapshot of the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any underlying read fails.
    pub async fn load(&self) -> ConfigResult<ConfigSnapshot> {
        Ok(ConfigSnapshot {
            global: self.global().await?,
            sites: self.list_sites().await?,
            rules: self.list_rules().await?,
        })
    }
}

async fn insert_subscription(
    conn: &mut SqliteConnection,
    site_id: &str,
    subscription: &RssSubscription,
) -> ConfigResult<()> {
    sqlx::query(
        "INSERT INTO rss_subscriptions (site_id, name, url, category, tag, interval_minutes, \
         download_sub_path, enabled, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )
    .bind(site_id)
    .bind(&subscription.name)
    .bind(&subscription.url)
    .bind(&subscription.category)
    .bind(&subscription.tag)
    .bind(i64::from(subscription.interval_minutes))
    .bind(&subscription.download_sub_path)
    .bind(subscription.enabled)
    .bind(Utc::now())
    .execute(conn)
    .await
    .map_err(|source| trawler_data::DataError::Query {
        operation: "config.insert_subscription",
        source,
    })?;
    Ok(())
}

fn site_from_row(row: SiteRow) -> ConfigResult<SiteConfig> {
    let schema: SiteSchema = row.schema_tag.parse().map_err(|err| {
        ConfigError::invalid("sites", "schema", format!("{err}"))
    })?;
    let auth = match row.auth_method.as_str() {
        "cookie" => AuthMethod::Cookie {
            cookie: row.cookie.unwrap_or_default(),
        },
        "api_key" => AuthMethod::ApiKey {
            key: row.api_key.unwrap_or_default(),
            api_url: row.api_url.unwrap_or_default(),
        },
        other => {
            return Err(ConfigError::invalid(
                "sites",
                "auth_method",
                format!("unknown auth method '{other}'"),
            ));
        }
    };
    Ok(SiteConfig {
        site_id: row.site_id,
        display_name: row.display_name,
        schema,
        base_url: row.base_url,
        auth,
        enabled: row.enabled,
        subscriptions: Vec::new(),
    })
}

fn rule_from_row(row: RuleRow) -> ConfigResult<FilterRule> {
    let pattern_type: PatternType = row
        .pattern_type
        .parse()
        .map_err(|err| ConfigError::invalid("filter_rules", "pattern_type", format!("{err}")))?;
    let match_field: MatchField = row
        .match_field
        .parse()
        .map_err(|err| ConfigError::invalid("filter_rules", "match_field", format!("{err}")))?;
    Ok(FilterRule {
        id: row.id,
        name: row.name,
        pattern: row.pattern,
        pattern_type,
        match_field,
        require_free: row.require_free,
        scope_site: row.scope_site,
        scope_rss: row.scope_rss,
        enabled: row.enabled,
        priority: i32::try_from(row.priority).unwrap_or_default(),
    })
}

fn validate_global(settings: &GlobalSettings) -> ConfigResult<()> {
    if settings.default_interval_minutes == 0 {
        return Err(ConfigError::invalid(
            "global",
            "default_interval_minutes",
            "must be positive",
        ));
    }
    if settings.torrent_size_gb == 0 {
        return Err(ConfigError::invalid(
            "global",
            "torrent_size_gb",
            "must be positive",
        ));
    }
    Ok(())
}

fn validate_site(site: &SiteConfig) -> ConfigResult<()> {
    if site.site_id.trim().is_empty() {
        return Err(ConfigError::invalid("sites", "site_id", "must not be empty"));
    }
    if Url::parse(&site.base_url).is_err() {
        return Err(ConfigError::invalid(
            "sites",
            "base_url",
            format!("'{}' is not a valid URL", site.base_url),
        ));
    }
    match &site.auth {
        AuthMethod::Cookie { cookie } if cookie.trim().is_empty() => {
            return Err(ConfigError::invalid("sites", "cookie", "must not be empty"));
        }
        AuthMethod::ApiKey { key, api_url } => {
            if key.trim().is_empty() {
                return Err(ConfigError::invalid("sites", "api_key", "must not be empty"));
            }
            if Url::parse(api_url).is_err() {
                return Err(ConfigError::invalid(
                    "sites",
                    "api_url",
                    format!("'{api_url}' is not a valid URL"),
                ));
            }
        }
        AuthMethod::Cookie { .. } => {}
    }
    let mut names = std::collections::HashSet::new();
    for subscription in &site.subscriptions {
        if subscription.name.trim().is_empty() {
            return Err(ConfigError::invalid("rss", "name", "must not be empty"));
        }
        if !names.insert(subscription.name.as_str()) {
            return Err(ConfigError::invalid(
                "rss",
                "name",
                format!("duplicate subscription name '{}'", subscription.name),
            ));
        }
        if Url::parse(&subscription.url).is_err() {
            return Err(ConfigError::invalid(
                "rss",
                "url",
                format!("'{}' is not a valid URL", subscription.url),
            ));
        }
    }
    Ok(())
}

fn validate_rule(rule: &FilterRule) -> ConfigResult<()> {
    if rule.pattern.trim().is_empty() {
        return Err(ConfigError::invalid(
            "filter_rules",
            "pattern",
            "must not be empty",
        ));
    }
    if rule.pattern_type == PatternType::Regex && regex::Regex::new(&rule.pattern).is_err() {
        return Err(ConfigError::invalid(
            "filter_rules",
            "pattern",
            format!("'{}' is not a valid regex", rule.pattern),
        ));
    }
    Ok(())
}
