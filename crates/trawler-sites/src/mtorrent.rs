//! Driver for the mTorrent JSON API family.
//!
//! Search results already carry the promotion facts, so `resolve_detail`
//! is a no-op for items fetched through the API; RSS-fed items fall back to
//! `torrent/detail`. Download URLs are minted per torrent via
//! `torrent/genDlToken`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
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
use crate::parse::bytes_to_mb;
use crate::registry::SiteDefinition;

/// JSON-API driver parameterised by a site definition.
pub struct MTorrentDriver {
    client: SiteClient,
    definition: SiteDefinition,
    downloader: Arc<dyn Downloader>,
    enabled: bool,
}

#[derive(Deserialize)]
struct Envelope {
    code: Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct TorrentPayload {
    id: Value,
    name: String,
    #[serde(default)]
    category: Option<Value>,
    #[serde(default)]
    size: Option<Value>,
    #[serde(default)]
    status: Option<StatusPayload>,
    #[serde(default, rename = "labelsNew")]
    labels: Vec<String>,
}

#[derive(Deserialize, Default)]
struct StatusPayload {
    #[serde(default)]
    discount: Option<String>,
    #[serde(default, rename = "discountEndTime")]
    discount_end_time: Option<String>,
}

#[derive(Deserialize)]
struct ProfilePayload {
    username: String,
    #[serde(default, rename = "createdDate")]
    created_date: Option<String>,
    #[serde(default, rename = "lastBrowse")]
    last_browse: Option<String>,
    #[serde(default, rename = "memberCount")]
    member_count: Option<MemberCountPayload>,
}

#[derive(Deserialize, Default)]
struct MemberCountPayload {
    #[serde(default)]
    uploaded: Option<Value>,
    #[serde(default)]
    downloaded: Option<Value>,
    #[serde(default, rename = "shareRate")]
    share_rate: Option<Value>,
    #[serde(default)]
    bonus: Option<Value>,
}

impl MTorrentDriver {
    /// Build a driver from its parts.
    #[must_use]
    pub const fn new(
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
        }
    }

    fn unwrap_envelope(&self, envelope: Envelope) -> DriverResult<Value> {
        let ok = match &envelope.code {
            Value::String(code) => code == "0",
            Value::Number(code) => code.as_i64() == Some(0),
            _ => false,
        };
        if ok {
            Ok(envelope.data)
        } else {
            Err(DriverError::Parse {
                site: self.site_id().to_string(),
                detail: format!(
                    "API returned code {} ({})",
                    envelope.code,
                    envelope.message.unwrap_or_default()
                ),
            })
        }
    }

    fn detail_from_payload(&self, payload: &TorrentPayload) -> TorrentDetail {
        let discount = payload
            .status
            .as_ref()
            .and_then(|status| status.discount.as_deref())
            .and_then(|tag| {
                self.definition
                    .discounts
                    .iter()
                    .find(|(candidate, _)| candidate == tag)
                    .map(|(_, level)| *level)
            })
            .unwrap_or(DiscountLevel::None);

        TorrentDetail {
            discount,
            free_end_time: payload
                .status
                .as_ref()
                .and_then(|status| status.discount_end_time.as_deref())
                .and_then(parse_site_local),
            has_hr: payload.labels.iter().any(|label| label.eq_ignore_ascii_case("hr")),
            size_mb: payload.size.as_ref().and_then(value_to_u64).map(bytes_to_mb).unwrap_or_default(),
        }
    }

    fn item_from_payload(&self, payload: &TorrentPayload) -> FeedItem {
        FeedItem {
            id: value_to_string(&payload.id),
            title: payload.name.clone(),
            page_url: None,
            download_url: None,
            category: payload.category.as_ref().map(value_to_string),
            size_mb: payload.size.as_ref().and_then(value_to_u64).map(bytes_to_mb),
            published_at: None,
            detail: Some(self.detail_from_payload(payload)),
        }
    }

    async fn fetch_detail_payload(
        &self,
        cancel: &CancellationToken,
        torrent_id: &str,
    ) -> DriverResult<TorrentPayload> {
        let url = self.client.api_endpoint(&self.definition.detail_path)?;
        let envelope: Envelope = self
            .client
            .post_json(cancel, &url, &json!({ "id": torrent_id }))
            .await?;
        let data = self.unwrap_envelope(envelope)?;
        serde_json::from_value(data).map_err(|err| DriverError::Parse {
            site: self.site_id().to_string(),
            detail: format!("unexpected detail payload: {err}"),
        })
    }

    async fn mint_download_url(
        &self,
        cancel: &CancellationToken,
        torrent_id: &str,
    ) -> DriverResult<Url> {
        let url = self.client.api_endpoint(&self.definition.download_path)?;
        let envelope: Envelope = self
            .client
            .post_json(cancel, &url, &json!({ "id": torrent_id }))
            .await?;
        let data = self.unwrap_envelope(envelope)?;
        let Value::String(link) = data else {
            return Err(DriverError::Parse {
                site: self.site_id().to_string(),
                detail: "download token response was not a URL".to_string(),
            });
        };
        Url::parse(&link).map_err(|err| DriverError::Parse {
            site: self.site_id().to_string(),
            detail: format!("invalid download URL '{link}': {err}"),
        })
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

#[async_trait]
impl SiteDriver for MTorrentDriver {
    fn site_id(&self) -> &str {
        self.client.site_id()
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn fetch_rss(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> DriverResult<Vec<FeedItem>> {
        if url.contains("torrent/search") {
            let endpoint = Url::parse(url).map_err(|err| DriverError::Parse {
                site: self.site_id().to_string(),
                detail: format!("invalid search URL '{url}': {err}"),
            })?;
            let envelope: Envelope = self
                .client
                .post_json(
                    cancel,
                    &endpoint,
                    &json!({ "mode": "normal", "pageNumber": 1, "pageSize": 100 }),
                )
                .await?;
            let data = self.unwrap_envelope(envelope)?;
            let torrents: Vec<TorrentPayload> = serde_json::from_value(
                data.get("data").cloned().unwrap_or(Value::Null),
            )
            .map_err(|err| DriverError::Parse {
                site: self.site_id().to_string(),
                detail: format!("unexpected search payload: {err}"),
            })?;
            debug!(site = %self.site_id(), results = torrents.len(), "API search page fetched");
            return Ok(torrents
                .iter()
                .map(|payload| self.item_from_payload(payload))
                .collect());
        }

        let feed_url = Url::parse(url).map_err(|err| DriverError::Parse {
            site: self.site_id().to_string(),
            detail: format!("invalid feed URL '{url}': {err}"),
        })?;
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
        let payload = self.fetch_detail_payload(cancel, &item.id).await?;
        Ok(self.detail_from_payload(&payload))
    }

    async fn download_torrent(
        &self,
        cancel: &CancellationToken,
        download_url: &str,
    ) -> DriverResult<Bytes> {
        let url = Url::parse(download_url).map_err(|err| DriverError::Parse {
            site: self.site_id().to_string(),
            detail: format!("invalid download URL '{download_url}': {err}"),
        })?;
        self.client.get_bytes(cancel, &url).await
    }

    async fn submit_to_downloader(
        &self,
        cancel: &CancellationToken,
        request: &SubmitRequest,
    ) -> DriverResult<String> {
        let url = if request.download_url.is_empty() {
            self.mint_download_url(cancel, &request.torrent_id).await?
        } else {
            Url::parse(&request.download_url).map_err(|err| DriverError::Parse {
                site: self.site_id().to_string(),
                detail: format!("invalid download URL '{}': {err}", request.download_url),
            })?
        };
        let payload = self.client.get_bytes(cancel, &url).await?;
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
        let step = self.definition.user_info.first().ok_or_else(|| {
            DriverError::Parse {
                site: self.site_id().to_string(),
                detail: "definition has no user-info step".to_string(),
            }
        })?;
        let url = self.client.api_endpoint(&step.path)?;
        let envelope: Envelope = self.client.post_json(cancel, &url, &json!({})).await?;
        let data = self.unwrap_envelope(envelope)?;
        let payload: ProfilePayload =
            serde_json::from_value(data).map_err(|err| DriverError::Parse {
                site: self.site_id().to_string(),
                detail: format!("unexpected profile payload: {err}"),
            })?;

        let counts = payload.member_count.unwrap_or_default();
        let mut profile = UserProfile {
            username: payload.username,
            uploaded_bytes: counts.uploaded.as_ref().and_then(value_to_u64).unwrap_or_default(),
            downloaded_bytes: counts
                .downloaded
                .as_ref()
                .and_then(value_to_u64)
                .unwrap_or_default(),
            ratio: counts
                .share_rate
                .as_ref()
                .and_then(value_to_f64)
                .unwrap_or_default(),
            bonus: counts.bonus.as_ref().and_then(value_to_f64).unwrap_or_default(),
            join_date: payload.created_date.as_deref().and_then(parse_site_local),
            last_access: payload.last_browse.as_deref().and_then(parse_site_local),
            ..UserProfile::default()
        };
        let (level_id, level_name) = resolve_level(&self.definition.levels, &profile, Utc::now());
        profile.level_id = level_id;
        profile.level_name = level_name;
        Ok(profile)
    }
}
