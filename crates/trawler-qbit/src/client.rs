use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lava_torrent::torrent::v1::Torrent;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use trawler_core::downloader::{AddTorrentOptions, DownloadStatus, Downloader};
use trawler_core::error::{DownloaderError, DownloaderResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// qBittorrent WebUI v2 client.
pub struct QbitClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct TorrentInfoRow {
    hash: String,
    name: String,
    state: String,
    progress: f64,
}

impl QbitClient {
    /// Build a client for the WebUI at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL does not parse or the HTTP client
    /// cannot be constructed.
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> DownloaderResult<Self> {
        let base_url = Url::parse(base_url).map_err(|err| DownloaderError::Decode {
            detail: format!("invalid WebUI URL '{base_url}': {err}"),
        })?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .cookie_store(true)
            .build()
            .map_err(|err| DownloaderError::Unreachable {
                detail: format!("failed to build HTTP client: {err}"),
            })?;
        Ok(Self {
            http,
            base_url,
            username: username.into(),
            password: password.into(),
        })
    }

    fn endpoint(&self, path: &str) -> DownloaderResult<Url> {
        self.base_url
            .join(path)
            .map_err(|err| DownloaderError::Decode {
                detail: format!("invalid WebUI path '{path}': {err}"),
            })
    }

    /// Send a request built by `build`, re-logging-in once on 403.
    async fn send_authenticated<F>(&self, build: F) -> DownloaderResult<Response>
    where
        F: Fn(&reqwest::Client) -> DownloaderResult<reqwest::RequestBuilder>,
    {
        let response = build(&self.http)?
            .send()
            .await
            .map_err(|err| DownloaderError::Unreachable {
                detail: err.to_string(),
            })?;

        if response.status() != StatusCode::FORBIDDEN {
            return check_status(response);
        }

        warn!("WebUI session expired; re-authenticating");
        self.login().await?;
        let retried = build(&self.http)?
            .send()
            .await
            .map_err(|err| DownloaderError::Unreachable {
                detail: err.to_string(),
            })?;
        check_status(retried)
    }

    fn add_form(payload: Option<(&str, Bytes)>, url: Option<&str>, options: &AddTorrentOptions) -> Form {
        let mut form = Form::new()
            .text("savepath", options.save_path.clone())
            .text("paused", if options.paused { "true" } else { "false" }.to_string());
        if let Some(category) = &options.category {
            form = form.text("category", category.clone());
        }
        if !options.tags.is_empty() {
            form = form.text("tags", options.tags.join(","));
        }
        if let Some(limit) = options.upload_limit_bps {
            form = form.text("upLimit", limit.to_string());
        }
        if let Some(limit) = options.download_limit_bps {
            form = form.text("dlLimit", limit.to_string());
        }
        if let Some((filename, bytes)) = payload {
            let part = Part::bytes(bytes.to_vec())
                .file_name(filename.to_string())
                .mime_str("application/x-bittorrent")
                .unwrap_or_else(|_| Part::bytes(bytes.to_vec()).file_name(filename.to_string()));
            form = form.part("torrents", part);
        }
        if let Some(url) = url {
            form = form.text("urls", url.to_string());
        }
        form
    }
}

fn check_status(response: Response) -> DownloaderResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(DownloaderError::Rejected {
            status: status.as_u16(),
        })
    }
}

/// Derive the v1 info-hash from raw metainfo bytes.
fn info_hash_of(payload: &Bytes) -> DownloaderResult<String> {
    let torrent =
        Torrent::read_from_bytes(payload.as_ref()).map_err(|err| DownloaderError::Decode {
            detail: format!("metainfo payload did not parse: {err}"),
        })?;
    Ok(torrent.info_hash().to_lowercase())
}

/// Lift the btih hash out of a magnet link, when present.
fn magnet_hash(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "magnet" {
        return None;
    }
    parsed
        .query_pairs()
        .find(|(key, _)| key == "xt")
        .and_then(|(_, value)| {
            value
                .strip_prefix("urn:btih:")
                .map(|hash| hash.to_lowercase())
        })
}

#[async_trait]
impl Downloader for QbitClient {
    async fn login(&self) -> DownloaderResult<()> {
        let url = self.endpoint("api/v2/auth/login")?;
        let referer = self.base_url.to_string();
        let response = self
            .http
            .post(url)
            .header("Referer", referer)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(|err| DownloaderError::Unreachable {
                detail: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(DownloaderError::Login);
        }
        let body = response.text().await.unwrap_or_default();
        if body.trim() == "Ok." {
            debug!("WebUI session established");
            Ok(())
        } else {
            Err(DownloaderError::Login)
        }
    }

    async fn add_by_url(&self, url: &str, options: &AddTorrentOptions) -> DownloaderResult<String> {
        let hash = magnet_hash(url).ok_or_else(|| DownloaderError::HashUnavailable {
            detail: "only magnet links carry a client-side derivable hash".to_string(),
        })?;
        let endpoint = self.endpoint("api/v2/torrents/add")?;
        self.send_authenticated(|http| {
            Ok(http
                .post(endpoint.clone())
                .multipart(Self::add_form(None, Some(url), options)))
        })
        .await?;
        Ok(hash)
    }

    async fn add_by_file(
        &self,
        filename: &str,
        payload: Bytes,
        options: &AddTorrentOptions,
    ) -> DownloaderResult<String> {
        let hash = info_hash_of(&payload)?;
        let endpoint = self.endpoint("api/v2/torrents/add")?;
        self.send_authenticated(|http| {
            Ok(http
                .post(endpoint.clone())
                .multipart(Self::add_form(Some((filename, payload.clone())), None, options)))
        })
        .await?;
        debug!(hash = %hash, save_path = %options.save_path, "torrent handed to the downloader");
        Ok(hash)
    }

    async fn status(&self, hash: &str) -> DownloaderResult<Option<DownloadStatus>> {
        let mut endpoint = self.endpoint("api/v2/torrents/info")?;
        endpoint
            .query_pairs_mut()
            .append_pair("hashes", hash);
        let response = self
            .send_authenticated(|http| Ok(http.get(endpoint.clone())))
            .await?;
        let rows: Vec<TorrentInfoRow> =
            response
                .json()
                .await
                .map_err(|err| DownloaderError::Decode {
                    detail: format!("torrent info did not decode: {err}"),
                })?;
        Ok(rows.into_iter().next().map(|row| DownloadStatus {
            hash: row.hash,
            name: row.name,
            state: row.state,
            progress: row.progress,
        }))
    }
}
