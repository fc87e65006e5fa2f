//! Per-site user statistics collection.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use trawler_core::driver::SiteDriver;
use trawler_core::model::UserProfile;

/// One site's normalised account statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct UserReport {
    /// Site the profile belongs to.
    pub site_id: String,
    /// Normalised statistics.
    pub profile: UserProfile,
}

/// Fetch user statistics from every enabled driver. Per-site failures are
/// reported and skipped; one misbehaving site never hides the others.
pub async fn collect_user_reports(
    drivers: &[Arc<dyn SiteDriver>],
    cancel: &CancellationToken,
) -> Vec<UserReport> {
    let mut reports = Vec::with_capacity(drivers.len());
    for driver in drivers {
        if cancel.is_cancelled() {
            break;
        }
        if !driver.enabled() {
            continue;
        }
        match driver.fetch_user_info(cancel).await {
            Ok(profile) => reports.push(UserReport {
                site_id: driver.site_id().to_string(),
                profile,
            }),
            Err(error) => {
                warn!(site = %driver.site_id(), error = %error, "user-info fetch failed");
            }
        }
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use trawler_core::driver::SubmitRequest;
    use trawler_core::error::{DriverError, DriverResult};
    use trawler_core::model::{FeedItem, TorrentDetail};

    struct StubDriver {
        site: &'static str,
        enabled: bool,
        fails: bool,
    }

    #[async_trait]
    impl SiteDriver for StubDriver {
        fn site_id(&self) -> &str {
            self.site
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        async fn fetch_rss(
            &self,
            _cancel: &CancellationToken,
            _url: &str,
        ) -> DriverResult<Vec<FeedItem>> {
            Ok(Vec::new())
        }

        async fn resolve_detail(
            &self,
            _cancel: &CancellationToken,
            _item: &FeedItem,
        ) -> DriverResult<TorrentDetail> {
            Ok(TorrentDetail::default())
        }

        async fn download_torrent(
            &self,
            _cancel: &CancellationToken,
            _download_url: &str,
        ) -> DriverResult<Bytes> {
            Ok(Bytes::new())
        }

        async fn submit_to_downloader(
            &self,
            _cancel: &CancellationToken,
            _request: &SubmitRequest,
        ) -> DriverResult<String> {
            Ok(String::new())
        }

        async fn fetch_user_info(&self, _cancel: &CancellationToken) -> DriverResult<UserProfile> {
            if self.fails {
                return Err(DriverError::Auth {
                    site: self.site.to_string(),
                });
            }
            Ok(UserProfile {
                username: format!("user-of-{}", self.site),
                ..UserProfile::default()
            })
        }
    }

    #[tokio::test]
    async fn collects_from_enabled_drivers_and_skips_failures() {
        let drivers: Vec<Arc<dyn SiteDriver>> = vec![
            Arc::new(StubDriver {
                site: "hdsky",
                enabled: true,
                fails: false,
            }),
            Arc::new(StubDriver {
                site: "mteam",
                enabled: true,
                fails: true,
            }),
            Arc::new(StubDriver {
                site: "rousi",
                enabled: false,
                fails: false,
            }),
        ];
        let cancel = CancellationToken::new();
        let reports = collect_user_reports(&drivers, &cancel).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].site_id, "hdsky");
        assert_eq!(reports[0].profile.username, "user-of-hdsky");
    }
}
