//! Driver construction: schema selects the behaviour, the registry
//! supplies the data.

use std::sync::Arc;

use trawler_config::SiteConfig;
use trawler_core::downloader::Downloader;
use trawler_core::driver::SiteDriver;
use trawler_core::error::{DriverError, DriverResult};
use trawler_core::model::SiteSchema;
use trawler_core::retry::RetryPolicy;
use trawler_data::SiteRateLimiter;

use crate::http::SiteClient;
use crate::mtorrent::MTorrentDriver;
use crate::nexusphp::NexusPhpDriver;
use crate::registry::Registry;

/// Build the driver for a configured site.
///
/// # Errors
///
/// Returns [`DriverError::Parse`] when no definition covers the site's
/// schema or a configured URL is invalid.
pub fn build_driver(
    site: &SiteConfig,
    limiter: Arc<SiteRateLimiter>,
    downloader: Arc<dyn Downloader>,
    policy: RetryPolicy,
) -> DriverResult<Arc<dyn SiteDriver>> {
    let definition = Registry::global()
        .resolve(&site.site_id, site.schema)
        .ok_or_else(|| DriverError::Parse {
            site: site.site_id.clone(),
            detail: format!("no site definition covers schema '{}'", site.schema),
        })?
        .clone();
    let client = SiteClient::new(site, limiter, policy)?;

    let driver: Arc<dyn SiteDriver> = match site.schema {
        SiteSchema::MTorrent => Arc::new(MTorrentDriver::new(
            client,
            definition,
            downloader,
            site.enabled,
        )),
        SiteSchema::NexusPhp
        | SiteSchema::Unit3d
        | SiteSchema::Gazelle
        | SiteSchema::HdDolby
        | SiteSchema::Rousi => Arc::new(NexusPhpDriver::new(
            client,
            definition,
            downloader,
            site.enabled,
        )),
    };
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use trawler_core::downloader::{AddTorrentOptions, DownloadStatus};
    use trawler_core::error::DownloaderResult;
    use trawler_core::model::AuthMethod;
    use trawler_data::{Database, RateLimitConfig};

    struct NullDownloader;

    #[async_trait]
    impl Downloader for NullDownloader {
        async fn login(&self) -> DownloaderResult<()> {
            Ok(())
        }

        async fn add_by_url(
            &self,
            _url: &str,
            _options: &AddTorrentOptions,
        ) -> DownloaderResult<String> {
            Ok(String::new())
        }

        async fn add_by_file(
            &self,
            _filename: &str,
            _payload: Bytes,
            _options: &AddTorrentOptions,
        ) -> DownloaderResult<String> {
            Ok(String::new())
        }

        async fn status(&self, _hash: &str) -> DownloaderResult<Option<DownloadStatus>> {
            Ok(None)
        }
    }

    async fn limiter(site: &str) -> Arc<SiteRateLimiter> {
        let db = Database::open_in_memory().await.expect("db");
        Arc::new(
            SiteRateLimiter::restore(db, site, RateLimitConfig::default(), Utc::now())
                .await
                .expect("limiter"),
        )
    }

    #[tokio::test]
    async fn selects_the_driver_by_schema() {
        let html_site = SiteConfig {
            site_id: "hdsky".to_string(),
            display_name: "HDSky".to_string(),
            schema: SiteSchema::NexusPhp,
            base_url: "https://hdsky.me".to_string(),
            auth: AuthMethod::Cookie {
                cookie: "uid=1".to_string(),
            },
            enabled: true,
            subscriptions: Vec::new(),
        };
        let driver = build_driver(
            &html_site,
            limiter("hdsky").await,
            Arc::new(NullDownloader),
            RetryPolicy::default(),
        )
        .expect("driver");
        assert_eq!(driver.site_id(), "hdsky");
        assert!(driver.enabled());

        let api_site = SiteConfig {
            site_id: "mteam".to_string(),
            display_name: "M-Team".to_string(),
            schema: SiteSchema::MTorrent,
            base_url: "https://kp.m-team.cc".to_string(),
            auth: AuthMethod::ApiKey {
                key: "key".to_string(),
                api_url: "https://api.m-team.cc/api".to_string(),
            },
            enabled: false,
            subscriptions: Vec::new(),
        };
        let driver = build_driver(
            &api_site,
            limiter("mteam").await,
            Arc::new(NullDownloader),
            RetryPolicy::default(),
        )
        .expect("driver");
        assert_eq!(driver.site_id(), "mteam");
        assert!(!driver.enabled());
    }

    #[tokio::test]
    async fn unknown_sites_fall_back_to_their_schema_definition() {
        let site = SiteConfig {
            site_id: "brand-new".to_string(),
            display_name: "Brand New".to_string(),
            schema: SiteSchema::NexusPhp,
            base_url: "https://new.example".to_string(),
            auth: AuthMethod::Cookie {
                cookie: "uid=1".to_string(),
            },
            enabled: true,
            subscriptions: Vec::new(),
        };
        let driver = build_driver(
            &site,
            limiter("brand-new").await,
            Arc::new(NullDownloader),
            RetryPolicy::default(),
        )
        .expect("schema fallback produces a driver");
        assert_eq!(driver.site_id(), "brand-new");
    }
}
