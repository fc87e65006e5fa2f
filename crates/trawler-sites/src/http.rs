//! Rate-limited, retrying HTTP plumbing shared by every driver.
//!
//! One `SiteClient` per site: it attaches the configured credentials, takes
//! a limiter allowance before every outbound attempt (retries included),
//! retries transient failures per the driver policy, and latches the
//! session invalid on a credential rejection so subsequent calls fail fast
//! until configuration changes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use trawler_config::SiteConfig;
use trawler_core::error::{DriverError, DriverResult};
use trawler_core::model::AuthMethod;
use trawler_core::retry::RetryPolicy;
use trawler_data::SiteRateLimiter;

const USER_AGENT: &str = concat!("trawler/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Site-scoped HTTP client with credentials, limiter, and retry discipline.
pub struct SiteClient {
    site_id: String,
    base_url: Url,
    api_url: Option<Url>,
    http: reqwest::Client,
    auth: AuthMethod,
    limiter: Arc<SiteRateLimiter>,
    policy: RetryPolicy,
    session_valid: AtomicBool,
}

impl SiteClient {
    /// Build a client for `site`.
    ///
    /// Proxy selection follows the process environment (`HTTP_PROXY`,
    /// `HTTPS_PROXY`, `ALL_PROXY`, `NO_PROXY` and their lowercase forms).
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Parse`] when a configured URL does not parse.
    pub fn new(
        site: &SiteConfig,
        limiter: Arc<SiteRateLimiter>,
        policy: RetryPolicy,
    ) -> DriverResult<Self> {
        let base_url = Url::parse(&site.base_url).map_err(|err| DriverError::Parse {
            site: site.site_id.clone(),
            detail: format!("invalid base URL '{}': {err}", site.base_url),
        })?;
        let api_url = match &site.auth {
            AuthMethod::ApiKey { api_url, .. } => {
                Some(Url::parse(api_url).map_err(|err| DriverError::Parse {
                    site: site.site_id.clone(),
                    detail: format!("invalid API URL '{api_url}': {err}"),
                })?)
            }
            AuthMethod::Cookie { .. } => None,
        };

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .gzip(true)
            .cookie_store(true)
            .build()
            .map_err(|err| DriverError::Transient {
                site: site.site_id.clone(),
                detail: format!("failed to build HTTP client: {err}"),
            })?;

        Ok(Self {
            site_id: site.site_id.clone(),
            base_url,
            api_url,
            http,
            auth: site.auth.clone(),
            limiter,
            policy,
            session_valid: AtomicBool::new(true),
        })
    }

    /// Site this client talks to.
    #[must_use]
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Whether a prior call invalidated the session.
    #[must_use]
    pub fn session_invalid(&self) -> bool {
        !self.session_valid.load(Ordering::Acquire)
    }

    /// Join a path or template onto the site base URL.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Parse`] when the joined URL is invalid.
    pub fn page_url(&self, path: &str) -> DriverResult<Url> {
        self.base_url.join(path).map_err(|err| DriverError::Parse {
            site: self.site_id.clone(),
            detail: format!("invalid path '{path}': {err}"),
        })
    }

    /// Join a path onto the API base URL (API-authenticated sites only).
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Parse`] when no API base is configured or the
    /// joined URL is invalid.
    pub fn api_endpoint(&self, path: &str) -> DriverResult<Url> {
        let Some(api_url) = &self.api_url else {
            return Err(DriverError::Parse {
                site: self.site_id.clone(),
                detail: "site has no API base URL configured".to_string(),
            });
        };
        // Treat the API base as a directory so relative joins append.
        let mut base = api_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(path).map_err(|err| DriverError::Parse {
            site: self.site_id.clone(),
            detail: format!("invalid API path '{path}': {err}"),
        })
    }

    /// GET a URL and return the response body.
    ///
    /// # Errors
    ///
    /// Propagates the classified request error.
    pub async fn get_bytes(&self, cancel: &CancellationToken, url: &Url) -> DriverResult<Bytes> {
        self.request(cancel, Method::GET, url, None).await
    }

    /// GET a URL and decode the body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Propagates the classified request error; undecodable bodies surface
    /// as [`DriverError::Parse`].
    pub async fn get_text(&self, cancel: &CancellationToken, url: &Url) -> DriverResult<String> {
        let body = self.get_bytes(cancel, url).await?;
        String::from_utf8(body.to_vec()).map_err(|err| DriverError::Parse {
            site: self.site_id.clone(),
            detail: format!("response is not valid UTF-8: {err}"),
        })
    }

    /// POST a JSON body and decode a JSON response.
    ///
    /// # Errors
    ///
    /// Propagates the classified request error; undecodable bodies surface
    /// as [`DriverError::Parse`].
    pub async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        url: &Url,
        body: &B,
    ) -> DriverResult<T> {
        let payload = serde_json::to_value(body).map_err(|err| DriverError::Parse {
            site: self.site_id.clone(),
            detail: format!("failed to encode request body: {err}"),
        })?;
        let bytes = self
            .request(cancel, Method::POST, url, Some(payload))
            .await?;
        serde_json::from_slice(&bytes).map_err(|err| DriverError::Parse {
            site: self.site_id.clone(),
            detail: format!("failed to decode response body: {err}"),
        })
    }

    async fn request(
        &self,
        cancel: &CancellationToken,
        method: Method,
        url: &Url,
        json_body: Option<serde_json::Value>,
    ) -> DriverResult<Bytes> {
        if self.session_invalid() {
            return Err(DriverError::Auth {
                site: self.site_id.clone(),
            });
        }

        let saw_rate_limit = AtomicBool::new(false);
        let result = self
            .policy
            .run(cancel, || {
                self.attempt(cancel, method.clone(), url.clone(), json_body.clone(), &saw_rate_limit)
            })
            .await;

        match result {
            Err(DriverError::Transient { site, .. })
                if saw_rate_limit.load(Ordering::Relaxed) =>
            {
                warn!(site = %site, url = %url, "rate limited by remote after retries");
                Err(DriverError::RateLimited { site })
            }
            other => other,
        }
    }

    async fn attempt(
        &self,
        cancel: &CancellationToken,
        method: Method,
        url: Url,
        json_body: Option<serde_json::Value>,
        saw_rate_limit: &AtomicBool,
    ) -> DriverResult<Bytes> {
        match self.limiter.wait(cancel).await {
            Ok(true) => {}
            Ok(false) => return Err(DriverError::Cancelled),
            Err(err) => {
                return Err(DriverError::Transient {
                    site: self.site_id.clone(),
                    detail: format!("rate-limit checkpoint failed: {err}"),
                });
            }
        }

        let mut builder = self
            .http
            .request(method, url)
            .headers(self.auth_headers());
        if let Some(body) = &json_body {
            builder = builder.json(body);
        }

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(DriverError::Cancelled),
            outcome = builder.send() => outcome.map_err(|err| self.classify_send_error(&err))?,
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.session_valid.store(false, Ordering::Release);
            return Err(DriverError::Auth {
                site: self.site_id.clone(),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            saw_rate_limit.store(true, Ordering::Relaxed);
            return Err(DriverError::Transient {
                site: self.site_id.clone(),
                detail: "HTTP 429".to_string(),
            });
        }
        if status.is_server_error() {
            return Err(DriverError::Transient {
                site: self.site_id.clone(),
                detail: format!("HTTP {status}"),
            });
        }
        if status.is_client_error() {
            return Err(DriverError::Rejected {
                site: self.site_id.clone(),
                status: status.as_u16(),
            });
        }

        response.bytes().await.map_err(|err| DriverError::Transient {
            site: self.site_id.clone(),
            detail: format!("failed to read response body: {err}"),
        })
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match &self.auth {
            AuthMethod::Cookie { cookie } => {
                if let Ok(value) = HeaderValue::from_str(cookie) {
                    headers.insert(COOKIE, value);
                }
            }
            AuthMethod::ApiKey { key, .. } => {
                if let Ok(value) = HeaderValue::from_str(key) {
                    headers.insert("x-api-key", value);
                }
            }
        }
        headers
    }

    fn classify_send_error(&self, err: &reqwest::Error) -> DriverError {
        DriverError::Transient {
            site: self.site_id.clone(),
            detail: if err.is_timeout() {
                "request timed out".to_string()
            } else {
                format!("connection failed: {err}")
            },
        }
    }
}
