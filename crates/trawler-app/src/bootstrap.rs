//! Application wiring: work directory, database, stores, downloader,
//! driver factory, and the command dispatch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trawler_config::{ConfigSnapshot, ConfigStore, bootstrap as config_bootstrap};
use trawler_core::downloader::{AddTorrentOptions, DownloadStatus, Downloader};
use trawler_core::driver::SiteDriver;
use trawler_core::error::{DownloaderError, DownloaderResult};
use trawler_core::retry::RetryPolicy;
use trawler_data::{Database, RateLimitConfig, TorrentStore, maintenance};
use trawler_engine::{Manager, ManagerConfig, collect_user_reports, run_single};
use trawler_qbit::QbitClient;
use trawler_sites::{Registry, build_driver};

use crate::cli::{Cli, Command, ConfigAction, DbAction, Mode};

const DB_FILE: &str = "trawler.db";
const BOOTSTRAP_FILE: &str = "trawler.toml";
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Dispatch a parsed command line.
///
/// # Errors
///
/// Returns an error on configuration or initialisation failure; the
/// process exits non-zero.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let work_dir = work_dir(cli.work_dir)?;
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("failed to create work directory {}", work_dir.display()))?;

    match cli.command {
        Command::Config {
            action: ConfigAction::Init,
        } => config_init(&work_dir),
        Command::Run { mode } => run_engine(&work_dir, mode).await,
        Command::Stats => print_stats(&work_dir).await,
        Command::Db { action } => run_db_action(&work_dir, action).await,
    }
}

fn work_dir(overridden: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = overridden {
        return Ok(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(".pt-tools"))
        .context("cannot locate a home directory; pass --work-dir")
}

fn config_init(work_dir: &std::path::Path) -> Result<()> {
    let path = work_dir.join(BOOTSTRAP_FILE);
    if path.exists() {
        bail!("refusing to overwrite existing {}", path.display());
    }
    std::fs::write(&path, config_bootstrap::default_document())
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "default configuration written");
    Ok(())
}

async fn open_stores(work_dir: &std::path::Path) -> Result<(Database, ConfigStore, TorrentStore)> {
    let db = Database::open(&work_dir.join(DB_FILE))
        .await
        .context("failed to open the database")?;
    let config = ConfigStore::new(db.clone());

    // First run only: seed from the bootstrap document when one exists.
    if !config.is_seeded().await? {
        let bootstrap_path = work_dir.join(BOOTSTRAP_FILE);
        if bootstrap_path.exists() {
            let text = std::fs::read_to_string(&bootstrap_path)
                .with_context(|| format!("failed to read {}", bootstrap_path.display()))?;
            let summary = config_bootstrap::import_toml(&config, &text)
                .await
                .context("bootstrap import failed")?;
            info!(
                sites = summary.sites,
                subscriptions = summary.subscriptions,
                "configuration seeded from bootstrap document"
            );
        }
    }

    let store = TorrentStore::new(db.clone());
    Ok((db, config, store))
}

/// Stand-in used when no downloader endpoint is configured; every
/// submission fails with a clear message while ingest keeps working.
struct UnconfiguredDownloader;

#[async_trait]
impl Downloader for UnconfiguredDownloader {
    async fn login(&self) -> DownloaderResult<()> {
        Err(DownloaderError::Unreachable {
            detail: "no downloader endpoint configured".to_string(),
        })
    }

    async fn add_by_url(
        &self,
        _url: &str,
        _options: &AddTorrentOptions,
    ) -> DownloaderResult<String> {
        self.login().await.map(|()| String::new())
    }

    async fn add_by_file(
        &self,
        _filename: &str,
        _payload: bytes::Bytes,
        _options: &AddTorrentOptions,
    ) -> DownloaderResult<String> {
        self.login().await.map(|()| String::new())
    }

    async fn status(&self, _hash: &str) -> DownloaderResult<Option<DownloadStatus>> {
        Err(DownloaderError::Unreachable {
            detail: "no downloader endpoint configured".to_string(),
        })
    }
}

fn downloader_for(snapshot: &ConfigSnapshot) -> Result<Arc<dyn Downloader>> {
    let endpoint = &snapshot.global.downloader;
    if endpoint.url.trim().is_empty() {
        warn!("no downloader endpoint configured; submissions will fail until one is set");
        return Ok(Arc::new(UnconfiguredDownloader));
    }
    let client = QbitClient::new(&endpoint.url, &endpoint.username, &endpoint.password)
        .context("invalid downloader endpoint")?;
    Ok(Arc::new(client))
}

fn rate_limits() -> HashMap<String, RateLimitConfig> {
    let registry = Registry::global();
    ["hdsky", "hddolby", "rousi", "unit3d", "gazelle", "mteam"]
        .iter()
        .filter_map(|site_id| {
            registry.get(site_id).map(|definition| {
                (
                    definition.site_id.clone(),
                    RateLimitConfig {
                        limit: definition.requests_per_window,
                        window: definition.window,
                    },
                )
            })
        })
        .collect()
}

fn manager_config(db: Database, store: TorrentStore, downloader: Arc<dyn Downloader>) -> ManagerConfig {
    ManagerConfig {
        db,
        store,
        driver_factory: Arc::new(move |site, limiter| {
            build_driver(site, limiter, Arc::clone(&downloader), RetryPolicy::default())
        }),
        rate_limits: rate_limits(),
        shutdown_deadline: SHUTDOWN_DEADLINE,
    }
}

async fn run_engine(work_dir: &std::path::Path, mode: Mode) -> Result<()> {
    let (db, config, store) = open_stores(work_dir).await?;
    let snapshot = config.load().await.context("failed to load configuration")?;
    if snapshot.global.download_dir.trim().is_empty() {
        bail!("global download_dir is unset; run `trawler config init` and edit the document");
    }
    let downloader = downloader_for(&snapshot)?;
    let engine_config = manager_config(db.clone(), store, downloader);

    match mode {
        Mode::Single => {
            let cancel = CancellationToken::new();
            let outcomes = run_single(&engine_config, &snapshot, &cancel)
                .await
                .context("single-pass run failed")?;
            for ((site, subscription), outcome) in outcomes {
                match outcome {
                    Ok(summary) => info!(
                        site = %site,
                        subscription = %subscription,
                        fetched = summary.fetched,
                        ingested = summary.ingested,
                        submitted = summary.submitted,
                        "pass complete"
                    ),
                    Err(error) => warn!(
                        site = %site,
                        subscription = %subscription,
                        error = %error,
                        "pass failed"
                    ),
                }
            }
        }
        Mode::Persistent => {
            let manager = Manager::new(engine_config);
            let forced = !snapshot.global.auto_start;
            if forced {
                // An explicit `run` is an explicit start; auto_start only
                // gates unattended boots.
                manager.reload(snapshot).await?;
            } else {
                manager.start(snapshot).await?;
            }
            info!(jobs = manager.job_count().await, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            info!("shutdown requested; draining jobs");
            manager.stop().await;
        }
    }

    db.close().await;
    Ok(())
}

async fn print_stats(work_dir: &std::path::Path) -> Result<()> {
    let (db, config, _store) = open_stores(work_dir).await?;
    let snapshot = config.load().await?;
    let downloader = downloader_for(&snapshot)?;

    let mut drivers: Vec<Arc<dyn SiteDriver>> = Vec::new();
    for site in snapshot.sites.iter().filter(|site| site.enabled) {
        let limits = rate_limits();
        let limit = limits.get(&site.site_id).copied().unwrap_or_default();
        let limiter = Arc::new(
            trawler_data::SiteRateLimiter::restore(db.clone(), site.site_id.clone(), limit, Utc::now())
                .await?,
        );
        match build_driver(site, limiter, Arc::clone(&downloader), RetryPolicy::default()) {
            Ok(driver) => drivers.push(driver),
            Err(error) => warn!(site = %site.site_id, error = %error, "skipping site"),
        }
    }

    let cancel = CancellationToken::new();
    let reports = collect_user_reports(&drivers, &cancel).await;
    if reports.is_empty() {
        println!("no user statistics available");
    }
    for report in reports {
        let profile = &report.profile;
        println!(
            "{:<12} {:<16} level={:<14} up={:.2} GiB down={:.2} GiB ratio={:.2} bonus={:.1}",
            report.site_id,
            profile.username,
            profile.level_name,
            gib(profile.uploaded_bytes),
            gib(profile.downloaded_bytes),
            profile.ratio,
            profile.bonus,
        );
    }

    db.close().await;
    Ok(())
}

fn gib(bytes: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        bytes as f64 / (1_024.0 * 1_024.0 * 1_024.0)
    }
}

async fn run_db_action(work_dir: &std::path::Path, action: DbAction) -> Result<()> {
    let db = Database::open(&work_dir.join(DB_FILE))
        .await
        .context("failed to open the database")?;

    match action {
        DbAction::FixTimezone { dry_run } => {
            let repairs = maintenance::repair_timezone(&db, dry_run)
                .await
                .context("timezone repair failed")?;
            for repair in &repairs {
                println!(
                    "{}/{}: '{}' -> {}",
                    repair.site_id, repair.torrent_id, repair.before, repair.after
                );
            }
            println!(
                "{} row(s) {}",
                repairs.len(),
                if dry_run { "would be repaired" } else { "repaired" }
            );
        }
        DbAction::Backup { dest } => {
            let dest = dest.unwrap_or_else(|| {
                work_dir.join(format!(
                    "trawler-{}.db",
                    Utc::now().format("%Y%m%d-%H%M%S")
                ))
            });
            maintenance::backup(&db, &dest).await.context("backup failed")?;
            println!("backup written to {}", dest.display());
        }
    }

    db.close().await;
    Ok(())
}
