//! Driver for the NexusPHP HTML family (NexusPHP, HDDolby, Rousi, Unit3D,
//! Gazelle dialects).
//!
//! Behaviour is generic; everything site-specific (paths, selectors,
//! discount classes, the level ladder) comes from the definition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use trawler_core::clock::parse_site_local;
use trawler_core::downloader::{AddTorrentOptions, Downloader};
use trawler_core::driver::{SiteDriver, SubmitRequest};
use trawler_core::error::{DriverError, DriverResult};
use trawler_core::model::{DiscountLevel, FeedItem, TorrentDetail, UserProfile};

use crate::feed::parse_feed;
use crate::http::SiteClient;
use crate::levels::resolve_level;
use crate::parse::{bytes_to_mb, parse_decimal, parse_size_bytes};
use crate::registry::SiteDefinition;

/// HTML-scraping driver parameterised by a site definition.
pub struct NexusPhpDriver {
    client: SiteClient,
    definition: SiteDefinition,
    downloader: Arc<dyn Downloader>,
    enabled: bool,
    max_retries: u32,
    retry_delay: Duration,
}

impl NexusPhpDriver {
    /// Build a driver from its parts.
    #[must_use]
    pub fn new(
        client: SiteClient,
        definition: SiteDefinition,
        downloader: Arc<dyn Downloader>,
        enabled: bool,
    ) -> Self {
        Self {
            client,
            definition,
            downloader,
            enabled,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    fn absolute_url(&self, candidate: &str) -> DriverResult<Url> {
        if let Ok(url) = Url::parse(candidate) {
            return Ok(url);
        }
        self.client.page_url(candidate)
    }

    fn parse_detail(&self, html: &str, fallback_size_mb: Option<u64>) -> TorrentDetail {
        let document = Html::parse_document(html);

        let discount = self
            .definition
            .discounts
            .iter()
            .find_map(|(class, level)| {
                let selector = Selector::parse(&format!(".{class}")).ok()?;
                document.select(&selector).next().map(|_| *level)
            })
            .unwrap_or(DiscountLevel::None);

        let free_end_time = Selector::parse(&self.definition.detail_selectors.deadline)
            .ok()
            .and_then(|selector| {
                document
                    .select(&selector)
                    .filter_map(|element| element.value().attr("title"))
                    .find_map(parse_site_local)
            });

        let has_hr = Selector::parse(&self.definition.detail_selectors.hit_and_run)
            .ok()
            .is_some_and(|selector| document.select(&selector).next().is_some());

        let size_mb = fallback_size_mb.or_else(|| {
            let selector = Selector::parse(&self.definition.detail_selectors.size).ok()?;
            document
                .select(&selector)
                .find_map(|element| extract_size(&element.text().collect::<String>()))
                .map(bytes_to_mb)
        });

        TorrentDetail {
            discount,
            free_end_time,
            has_hr,
            size_mb: size_mb.unwrap_or_default(),
        }
    }

    fn scrape_fields(&self, html: &str, selectors: &HashMap<String, String>) -> HashMap<String, String> {
        let document = Html::parse_document(html);
        let mut fields = HashMap::new();
        for (field, selector_text) in selectors {
            let Ok(selector) = Selector::parse(selector_text) else {
                continue;
            };
            if let Some(element) = document.select(&selector).next() {
                // Precise values live in `title` attributes; the element text
                // is often a fuzzy rendering ("4 years ago").
                let value = element
                    .value()
                    .attr("title")
                    .map(str::to_string)
                    .filter(|title| !title.trim().is_empty())
                    .unwrap_or_else(|| element.text().collect::<String>().trim().to_string());
                fields.insert(field.clone(), value);
            }
        }
        fields
    }

    fn profile_from_fields(&self, fields: &HashMap<String, String>) -> UserProfile {
        let uploaded_bytes = fields
            .get("uploaded")
            .and_then(|text| parse_size_bytes(text))
            .unwrap_or_default();
        let downloaded_bytes = fields
            .get("downloaded")
            .and_then(|text| parse_size_bytes(text))
            .unwrap_or_default();

        let mut profile = UserProfile {
            username: fields.get("username").cloned().unwrap_or_default(),
            uploaded_bytes,
            downloaded_bytes,
            ratio: ratio_of(uploaded_bytes, downloaded_bytes),
            bonus: fields
                .get("bonus")
                .and_then(|text| parse_decimal(text))
                .unwrap_or_default(),
            join_date: fields.get("join_date").and_then(|text| parse_site_local(text)),
            last_access: fields
                .get("last_access")
                .and_then(|text| parse_site_local(text)),
            ..UserProfile::default()
        };

        let (level_id, level_name) = resolve_level(&self.definition.levels, &profile, Utc::now());
        profile.level_id = level_id;
        profile.level_name = level_name;
        profile
    }
}

fn ratio_of(uploaded: u64, downloaded: u64) -> f64 {
    if downloaded == 0 {
        if uploaded == 0 { 0.0 } else { f64::INFINITY }
    } else {
        bytes_as_f64(uploaded) / bytes_as_f64(downloaded)
    }
}

const fn bytes_as_f64(value: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        value as f64
    }
}

/// Pull a size token out of a label like `大小: 64 MB` or `Size: 1.5 GiB`.
fn extract_size(text: &str) -> Option<u64> {
    let trimmed = text.trim();
    if let Some(size) = parse_size_bytes(trimmed) {
        return Some(size);
    }
    trimmed
        .rsplit([':', '：'])
        .next()
        .and_then(|tail| parse_size_bytes(tail))
}

#[async_trait]
impl SiteDriver for NexusPhpDriver {
    fn site_id(&self) -> &str {
        self.client.site_id()
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    async fn fetch_rss(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> DriverResult<Vec<FeedItem>> {
        let feed_url = self.absolute_url(url)?;
        let body = self.client.get_bytes(cancel, &feed_url).await?;
        parse_feed(self.site_id(), &body)
    }

    async fn resolve_detail(
        &self,
        cancel: &CancellationToken,
        item: &FeedItem,
    ) -> DriverResult<TorrentDetail> {
        if let Some(detail) = item.detail {
            return Ok(detail);
        }
        let path = self.definition.detail_path.replace("{id}", &item.id);
        let url = self.absolute_url(&path)?;
        let html = self.client.get_text(cancel, &url).await?;
        let detail = self.parse_detail(&html, item.size_mb);
        debug!(
            site = %self.site_id(),
            torrent = %item.id,
            discount = %detail.discount,
            "resolved detail page"
        );
        Ok(detail)
    }

    async fn download_torrent(
        &self,
        cancel: &CancellationToken,
        download_url: &str,
    ) -> DriverResult<Bytes> {
        let url = self.absolute_url(download_url)?;
        self.client.get_bytes(cancel, &url).await
    }

    async fn submit_to_downloader(
        &self,
        cancel: &CancellationToken,
        request: &SubmitRequest,
    ) -> DriverResult<String> {
        let payload = self.download_torrent(cancel, &request.download_url).await?;
        let options = AddTorrentOptions {
            save_path: request.save_path.clone(),
            category: request.category.clone(),
            tags: request.tags.clone(),
            paused: request.paused,
            upload_limit_bps: request.upload_limit_bps,
            download_limit_bps: request.download_limit_bps,
        };
        let filename = format!("{}.torrent", request.title);
        let hash = self
            .downloader
            .add_by_file(&filename, payload, &options)
            .await?;
        Ok(hash)
    }

    async fn fetch_user_info(&self, cancel: &CancellationToken) -> DriverResult<UserProfile> {
        let mut fields = HashMap::new();
        for step in &self.definition.user_info {
            let url = self.client.page_url(&step.path)?;
            let html = self.client.get_text(cancel, &url).await?;
            fields.extend(self.scrape_fields(&html, &step.selectors));
        }
        if fields.is_empty() {
            return Err(DriverError::Parse {
                site: self.site_id().to_string(),
                detail: "user-info plan produced no fields".to_string(),
            });
        }
        Ok(self.profile_from_fields(&fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use httpmock::prelude::*;
    use trawler_config::SiteConfig;
    use trawler_core::error::DownloaderResult;
    use trawler_core::model::{AuthMethod, SiteSchema};
    use trawler_core::retry::RetryPolicy;
    use trawler_data::{Database, RateLimitConfig, SiteRateLimiter};

    struct RecordingDownloader {
        added: tokio::sync::Mutex<Vec<(String, AddTorrentOptions)>>,
    }

    #[async_trait]
    impl Downloader for RecordingDownloader {
        async fn login(&self) -> DownloaderResult<()> {
            Ok(())
        }

        async fn add_by_url(
            &self,
            _url: &str,
            _options: &AddTorrentOptions,
        ) -> DownloaderResult<String> {
            Ok("unused".to_string())
        }

        async fn add_by_file(
            &self,
            filename: &str,
            _payload: Bytes,
            options: &AddTorrentOptions,
        ) -> DownloaderResult<String> {
            self.added
                .lock()
                .await
                .push((filename.to_string(), options.clone()));
            Ok("cafebabe".to_string())
        }

        async fn status(
            &self,
            _hash: &str,
        ) -> DownloaderResult<Option<trawler_core::downloader::DownloadStatus>> {
            Ok(None)
        }
    }

    async fn driver(server: &MockServer) -> (NexusPhpDriver, Arc<RecordingDownloader>) {
        let site = SiteConfig {
            site_id: "hdsky".to_string(),
            display_name: "HDSky".to_string(),
            schema: SiteSchema::NexusPhp,
            base_url: server.base_url(),
            auth: AuthMethod::Cookie {
                cookie: "uid=1; pass=secret".to_string(),
            },
            enabled: true,
            subscriptions: Vec::new(),
        };
        let db = Database::open_in_memory().await.expect("db");
        let limiter = Arc::new(
            SiteRateLimiter::restore(db, "hdsky", RateLimitConfig::default(), Utc::now())
                .await
                .expect("limiter"),
        );
        let policy = RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_millis(5),
            factor: 2,
            max_delay: Duration::from_millis(10),
            jitter_ratio: 0.0,
        };
        let client = SiteClient::new(&site, limiter, policy).expect("client");
        let definition = Registry::global().get("hdsky").expect("definition").clone();
        let downloader = Arc::new(RecordingDownloader {
            added: tokio::sync::Mutex::new(Vec::new()),
        });
        let dyn_downloader: Arc<dyn Downloader> = Arc::clone(&downloader) as Arc<dyn Downloader>;
        (
            NexusPhpDriver::new(client, definition, dyn_downloader, true),
            downloader,
        )
    }

    const DETAIL_FREE: &str = r#"<html><body>
<h1 id="top">M1 <img class="pro_free" alt="Free" />
  <span title="2030-06-01 23:59:59">剩余时间</span></h1>
<img class="hitandrun" alt="HR" />
<table><tr><td class="rowfollow" valign="top">大小: 64 MB</td></tr></table>
</body></html>"#;

    const DETAIL_PLAIN: &str = r#"<html><body>
<h1 id="top">M2</h1>
<table><tr><td class="rowfollow" valign="top">大小: 1.5 GiB</td></tr></table>
</body></html>"#;

    #[tokio::test]
    async fn detail_page_yields_discount_deadline_and_hr() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/details.php");
                then.status(200).body(DETAIL_FREE);
            })
            .await;

        let (driver, _) = driver(&server).await;
        let cancel = CancellationToken::new();
        let item = FeedItem {
            id: "101".to_string(),
            title: "M1".to_string(),
            page_url: None,
            download_url: None,
            category: None,
            size_mb: None,
            published_at: None,
            detail: None,
        };
        let detail = driver.resolve_detail(&cancel, &item).await.expect("detail");

        assert_eq!(detail.discount, DiscountLevel::Free);
        assert!(detail.has_hr);
        assert_eq!(detail.size_mb, 64);
        let deadline = detail.free_end_time.expect("bounded window");
        assert_eq!(
            deadline,
            parse_site_local("2030-06-01 23:59:59").expect("parse")
        );
    }

    #[tokio::test]
    async fn plain_detail_page_means_no_discount() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/details.php");
                then.status(200).body(DETAIL_PLAIN);
            })
            .await;

        let (driver, _) = driver(&server).await;
        let cancel = CancellationToken::new();
        let item = FeedItem {
            id: "102".to_string(),
            title: "M2".to_string(),
            page_url: None,
            download_url: None,
            category: None,
            size_mb: None,
            published_at: None,
            detail: None,
        };
        let detail = driver.resolve_detail(&cancel, &item).await.expect("detail");

        assert_eq!(detail.discount, DiscountLevel::None);
        assert!(!detail.has_hr);
        assert!(detail.free_end_time.is_none());
        assert_eq!(detail.size_mb, 1_536);
    }

    #[tokio::test]
    async fn inline_detail_skips_the_page_fetch() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/details.php");
                then.status(200).body(DETAIL_FREE);
            })
            .await;

        let (driver, _) = driver(&server).await;
        let cancel = CancellationToken::new();
        let inline = TorrentDetail {
            discount: DiscountLevel::DoubleFree,
            free_end_time: None,
            has_hr: false,
            size_mb: 10,
        };
        let item = FeedItem {
            id: "103".to_string(),
            title: "M3".to_string(),
            page_url: None,
            download_url: None,
            category: None,
            size_mb: None,
            published_at: None,
            detail: Some(inline),
        };
        let detail = driver.resolve_detail(&cancel, &item).await.expect("detail");
        assert_eq!(detail, inline);
        assert_eq!(mock.calls_async().await, 0);
    }

    #[tokio::test]
    async fn submit_downloads_and_hands_to_the_downloader() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/download.php");
                then.status(200).body("d8:announce0:e");
            })
            .await;

        let (driver, downloader) = driver(&server).await;
        let cancel = CancellationToken::new();
        let request = SubmitRequest {
            torrent_id: "101".to_string(),
            title: "M1".to_string(),
            download_url: format!("{}/download.php?id=101", server.base_url()),
            save_path: "/tmp/d/hdsky/".to_string(),
            category: Some("movies".to_string()),
            tags: vec!["auto".to_string()],
            paused: false,
            upload_limit_bps: None,
            download_limit_bps: None,
        };
        let hash = driver
            .submit_to_downloader(&cancel, &request)
            .await
            .expect("submit");
        assert_eq!(hash, "cafebabe");

        let added = downloader.added.lock().await;
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, "M1.torrent");
        assert_eq!(added[0].1.save_path, "/tmp/d/hdsky/");
        assert_eq!(added[0].1.tags, vec!["auto".to_string()]);
    }

    const USER_PAGE: &str = r#"<html><body>
<a href="userdetails.php?id=9"><b>seeder42</b></a>
<font class="color_uploaded">120 GB</font>
<font class="color_downloaded">40 GB</font>
<font class="color_bonus">12,345.6</font>
<table><tr><td class="rowfollow"><span title="2020-01-01 00:00:00">4 years ago</span></td></tr></table>
</body></html>"#;

    #[tokio::test]
    async fn user_info_normalises_and_resolves_a_level() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/userdetails.php");
                then.status(200).body(USER_PAGE);
            })
            .await;

        let (driver, _) = driver(&server).await;
        let cancel = CancellationToken::new();
        let profile = driver.fetch_user_info(&cancel).await.expect("profile");

        assert_eq!(profile.username, "seeder42");
        assert_eq!(profile.uploaded_bytes, 120 * 1_024 * 1_024 * 1_024);
        assert!((profile.ratio - 3.0).abs() < f64::EPSILON);
        assert_eq!(profile.bonus, 12_345.6);
        assert!(profile.join_date.is_some());
        assert_eq!(profile.level_name, "Elite User");
    }
}
