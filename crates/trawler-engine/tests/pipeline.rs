//! End-to-end pipeline scenarios against a scripted driver and an
//! in-memory store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use trawler_config::{ConfigSnapshot, GlobalSettings, RssSubscription, SiteConfig};
use trawler_core::driver::{SiteDriver, SubmitRequest};
use trawler_core::error::{DriverError, DriverResult};
use trawler_core::model::{
    AuthMethod, DiscountLevel, FeedItem, SiteSchema, TorrentDetail, UserProfile,
};
use trawler_data::{Database, RateLimitConfig, SiteRateLimiter, TorrentStore};
use trawler_engine::{
    DriverFactory, EngineError, Manager, ManagerConfig, ManagerState, RuleSet, TickContext,
    run_tick,
};

struct ScriptedDriver {
    site: String,
    feed: std::sync::Mutex<Vec<FeedItem>>,
    details: std::sync::Mutex<HashMap<String, TorrentDetail>>,
    auth_fail: AtomicBool,
    fetch_calls: AtomicUsize,
    submit_calls: AtomicUsize,
    submitted: std::sync::Mutex<Vec<SubmitRequest>>,
}

impl ScriptedDriver {
    fn new(site: &str) -> Self {
        Self {
            site: site.to_string(),
            feed: std::sync::Mutex::new(Vec::new()),
            details: std::sync::Mutex::new(HashMap::new()),
            auth_fail: AtomicBool::new(false),
            fetch_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            submitted: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn set_feed(&self, items: Vec<FeedItem>) {
        *self.feed.lock().expect("feed lock") = items;
    }

    fn set_detail(&self, id: &str, detail: TorrentDetail) {
        self.details
            .lock()
            .expect("details lock")
            .insert(id.to_string(), detail);
    }

    fn submissions(&self) -> Vec<SubmitRequest> {
        self.submitted.lock().expect("submitted lock").clone()
    }
}

fn item(id: &str, title: &str) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        title: title.to_string(),
        page_url: None,
        download_url: Some(format!("https://tracker.example/download.php?id={id}")),
        category: Some("movies".to_string()),
        size_mb: None,
        published_at: None,
        detail: None,
    }
}

fn free_detail(size_mb: u64, free_for: Duration) -> TorrentDetail {
    TorrentDetail {
        discount: DiscountLevel::Free,
        free_end_time: Some(Utc::now() + free_for),
        has_hr: false,
        size_mb,
    }
}

#[async_trait]
impl SiteDriver for ScriptedDriver {
    fn site_id(&self) -> &str {
        &self.site
    }

    async fn fetch_rss(
        &self,
        _cancel: &CancellationToken,
        _url: &str,
    ) -> DriverResult<Vec<FeedItem>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.auth_fail.load(Ordering::SeqCst) {
            return Err(DriverError::Auth {
                site: self.site.clone(),
            });
        }
        Ok(self.feed.lock().expect("feed lock").clone())
    }

    async fn resolve_detail(
        &self,
        _cancel: &CancellationToken,
        item: &FeedItem,
    ) -> DriverResult<TorrentDetail> {
        if let Some(detail) = item.detail {
            return Ok(detail);
        }
        self.details
            .lock()
            .expect("details lock")
            .get(&item.id)
            .copied()
            .ok_or_else(|| DriverError::Parse {
                site: self.site.clone(),
                detail: format!("no scripted detail for '{}'", item.id),
            })
    }

    async fn download_torrent(
        &self,
        _cancel: &CancellationToken,
        _download_url: &str,
    ) -> DriverResult<Bytes> {
        Ok(Bytes::from_static(b"d8:announce0:e"))
    }

    async fn submit_to_downloader(
        &self,
        _cancel: &CancellationToken,
        request: &SubmitRequest,
    ) -> DriverResult<String> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.submitted
            .lock()
            .expect("submitted lock")
            .push(request.clone());
        Ok(format!("hash-{}", request.torrent_id))
    }

    async fn fetch_user_info(&self, _cancel: &CancellationToken) -> DriverResult<UserProfile> {
        Ok(UserProfile::default())
    }
}

fn global() -> GlobalSettings {
    GlobalSettings {
        download_dir: "/tmp/d".to_string(),
        torrent_size_gb: 500,
        free_gate_hours: 1,
        ..GlobalSettings::default()
    }
}

fn subscription(name: &str) -> RssSubscription {
    RssSubscription {
        name: name.to_string(),
        url: "https://tracker.example/rss".to_string(),
        category: Some("movies".to_string()),
        tag: Some("auto".to_string()),
        interval_minutes: 1,
        download_sub_path: "hdsky/".to_string(),
        enabled: true,
    }
}

async fn context(driver: Arc<ScriptedDriver>) -> (TickContext, TorrentStore) {
    let db = Database::open_in_memory().await.expect("db");
    let store = TorrentStore::new(db.clone());
    let limiter = Arc::new(
        SiteRateLimiter::restore(db, "hdsky", RateLimitConfig::default(), Utc::now())
            .await
            .expect("limiter"),
    );
    let sub = subscription("R1");
    let context = TickContext {
        site_id: "hdsky".to_string(),
        subscription: sub.clone(),
        site_subscriptions: vec![sub],
        global: global(),
        driver,
        limiter,
        store: store.clone(),
        rules: Arc::new(RuleSet::compile(&[])),
    };
    (context, store)
}

#[tokio::test]
async fn happy_free_item_is_persisted_and_submitted() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    driver.set_feed(vec![item("guid-1", "M1")]);
    driver.set_detail("guid-1", free_detail(64, Duration::hours(2)));

    let (ctx, store) = context(Arc::clone(&driver)).await;
    let cancel = CancellationToken::new();
    let summary = run_tick(&ctx, &cancel).await.expect("tick");

    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.submitted, 1);

    let record = store
        .get("hdsky", "guid-1")
        .await
        .expect("get")
        .expect("row present");
    assert!(record.submitted);
    assert_eq!(record.downloader_hash.as_deref(), Some("hash-guid-1"));
    assert_eq!(record.save_path.as_deref(), Some("/tmp/d/hdsky/"));
    assert_eq!(driver.submit_calls.load(Ordering::SeqCst), 1);

    let submissions = driver.submissions();
    assert_eq!(submissions[0].category.as_deref(), Some("movies"));
    assert_eq!(submissions[0].tags, vec!["auto".to_string()]);
}

#[tokio::test]
async fn oversize_items_are_neither_persisted_nor_submitted() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    driver.set_feed(vec![item("guid-big", "Huge")]);
    driver.set_detail("guid-big", free_detail(600 * 1_024, Duration::hours(2)));

    let (ctx, store) = context(Arc::clone(&driver)).await;
    let cancel = CancellationToken::new();
    let summary = run_tick(&ctx, &cancel).await.expect("tick");

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.ingested, 0);
    assert!(
        store
            .get("hdsky", "guid-big")
            .await
            .expect("get")
            .is_none()
    );
    assert_eq!(driver.submit_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn short_free_window_defers_until_extended_then_submits_once() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    driver.set_feed(vec![item("guid-1", "M1")]);
    driver.set_detail("guid-1", free_detail(64, Duration::minutes(30)));

    let (ctx, store) = context(Arc::clone(&driver)).await;
    let cancel = CancellationToken::new();

    let first = run_tick(&ctx, &cancel).await.expect("first tick");
    assert_eq!(first.ingested, 1);
    assert_eq!(first.submitted, 0, "window below the gate defers");
    let record = store
        .get("hdsky", "guid-1")
        .await
        .expect("get")
        .expect("row persisted despite deferral");
    assert!(!record.submitted);

    // The tracker extends the promotion; the re-observation merges and the
    // submission phase picks it up.
    driver.set_detail("guid-1", free_detail(64, Duration::hours(2)));
    let second = run_tick(&ctx, &cancel).await.expect("second tick");
    assert_eq!(second.submitted, 1);

    let third = run_tick(&ctx, &cancel).await.expect("third tick");
    assert_eq!(third.submitted, 0, "submission happens exactly once");
    assert_eq!(driver.submit_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn identical_feeds_across_ticks_yield_one_row_and_one_submission() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    driver.set_feed(vec![item("guid-1", "M1")]);
    driver.set_detail("guid-1", free_detail(64, Duration::hours(2)));

    let (ctx, store) = context(Arc::clone(&driver)).await;
    let cancel = CancellationToken::new();

    run_tick(&ctx, &cancel).await.expect("first tick");
    let second = run_tick(&ctx, &cancel).await.expect("second tick");

    assert_eq!(second.duplicates, 1, "submitted rows are closed to ingest");
    assert_eq!(store.live_count().await.expect("count"), 1);
    assert_eq!(driver.submit_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn auth_failure_ends_the_tick_with_no_writes() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    driver.set_feed(vec![item("guid-1", "M1")]);
    driver.auth_fail.store(true, Ordering::SeqCst);

    let (ctx, store) = context(Arc::clone(&driver)).await;
    let cancel = CancellationToken::new();
    let outcome = run_tick(&ctx, &cancel).await;

    assert!(matches!(
        outcome,
        Err(EngineError::Driver {
            source: DriverError::Auth { .. }
        })
    ));
    assert_eq!(store.live_count().await.expect("count"), 0);

    // The failure mode persists until credentials change.
    let again = run_tick(&ctx, &cancel).await;
    assert!(again.is_err());
    assert_eq!(driver.fetch_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn items_are_persisted_in_feed_order() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    // Ids deliberately out of lexicographic order.
    driver.set_feed(vec![item("c", "first"), item("a", "second"), item("b", "third")]);
    for id in ["a", "b", "c"] {
        driver.set_detail(id, free_detail(64, Duration::hours(2)));
    }

    let (ctx, store) = context(Arc::clone(&driver)).await;
    let cancel = CancellationToken::new();
    run_tick(&ctx, &cancel).await.expect("tick");

    let mut rows = Vec::new();
    for id in ["a", "b", "c"] {
        rows.push(store.get("hdsky", id).await.expect("get").expect("row"));
    }
    let c = rows.iter().find(|r| r.torrent_id == "c").expect("c");
    let a = rows.iter().find(|r| r.torrent_id == "a").expect("a");
    let b = rows.iter().find(|r| r.torrent_id == "b").expect("b");
    assert!(c.first_seen <= a.first_seen, "feed order drives first-seen");
    assert!(a.first_seen <= b.first_seen, "feed order drives first-seen");
}

#[tokio::test]
async fn non_free_items_fall_to_the_default_policy() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    driver.set_feed(vec![item("paid", "Paid"), item("free", "Free")]);
    driver.set_detail(
        "paid",
        TorrentDetail {
            discount: DiscountLevel::None,
            free_end_time: None,
            has_hr: false,
            size_mb: 64,
        },
    );
    driver.set_detail("free", free_detail(64, Duration::hours(2)));

    let (ctx, store) = context(Arc::clone(&driver)).await;
    let cancel = CancellationToken::new();
    let summary = run_tick(&ctx, &cancel).await.expect("tick");

    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.skipped, 1);
    assert!(store.get("hdsky", "paid").await.expect("get").is_none());
    assert!(store.get("hdsky", "free").await.expect("get").is_some());
}

fn snapshot(sites: Vec<SiteConfig>) -> ConfigSnapshot {
    ConfigSnapshot {
        global: GlobalSettings {
            auto_start: true,
            ..global()
        },
        sites,
        rules: Vec::new(),
    }
}

fn site(site_id: &str, subscriptions: Vec<RssSubscription>) -> SiteConfig {
    SiteConfig {
        site_id: site_id.to_string(),
        display_name: site_id.to_string(),
        schema: SiteSchema::NexusPhp,
        base_url: "https://tracker.example".to_string(),
        auth: AuthMethod::Cookie {
            cookie: "uid=1".to_string(),
        },
        enabled: true,
        subscriptions,
    }
}

fn factory(driver: Arc<ScriptedDriver>) -> DriverFactory {
    Arc::new(move |_site, _limiter| Ok(Arc::clone(&driver) as Arc<dyn SiteDriver>))
}

async fn manager(driver: Arc<ScriptedDriver>) -> Manager {
    let db = Database::open_in_memory().await.expect("db");
    Manager::new(ManagerConfig {
        db: db.clone(),
        store: TorrentStore::new(db),
        driver_factory: factory(driver),
        rate_limits: HashMap::new(),
        shutdown_deadline: StdDuration::from_secs(5),
    })
}

#[tokio::test]
async fn reload_reconciles_the_job_set() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    let manager = manager(Arc::clone(&driver)).await;

    let two_feeds = snapshot(vec![site(
        "hdsky",
        vec![subscription("R1"), subscription("R2")],
    )]);
    manager.reload(two_feeds).await.expect("reload");
    assert_eq!(manager.job_count().await, 2);
    assert_eq!(manager.state(), ManagerState::Running);

    // Dropping R2 and disabling nothing else cancels exactly that job.
    let one_feed = snapshot(vec![site("hdsky", vec![subscription("R1")])]);
    manager.reload(one_feed).await.expect("reload");
    assert_eq!(manager.job_count().await, 1);

    // A parameter change (interval) restarts the job under the same key.
    let mut changed = subscription("R1");
    changed.interval_minutes = 30;
    let retimed = snapshot(vec![site("hdsky", vec![changed])]);
    manager.reload(retimed).await.expect("reload");
    assert_eq!(manager.job_count().await, 1);

    // A disabled site drains every job.
    let mut disabled = site("hdsky", vec![subscription("R1")]);
    disabled.enabled = false;
    manager
        .reload(snapshot(vec![disabled]))
        .await
        .expect("reload");
    assert_eq!(manager.job_count().await, 0);

    manager.stop().await;
    assert_eq!(manager.state(), ManagerState::Stopped);
}

#[tokio::test]
async fn jobs_with_invalid_config_are_skipped_not_fatal() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    let manager = manager(Arc::clone(&driver)).await;

    let mut broken = subscription("broken");
    broken.url = "  ".to_string();
    let mixed = snapshot(vec![site("hdsky", vec![broken, subscription("R1")])]);
    manager.reload(mixed).await.expect("reload");

    assert_eq!(manager.job_count().await, 1, "only the valid job starts");
    manager.stop().await;
}

#[tokio::test]
async fn start_stays_idle_without_auto_start_or_download_dir() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    let manager = manager(Arc::clone(&driver)).await;

    let mut no_autostart = snapshot(vec![site("hdsky", vec![subscription("R1")])]);
    no_autostart.global.auto_start = false;
    manager.start(no_autostart).await.expect("start");
    assert_eq!(manager.job_count().await, 0);

    let mut no_dir = snapshot(vec![site("hdsky", vec![subscription("R1")])]);
    no_dir.global.download_dir = String::new();
    manager.start(no_dir).await.expect("start");
    assert_eq!(manager.job_count().await, 0);

    let ready = snapshot(vec![site("hdsky", vec![subscription("R1")])]);
    manager.start(ready).await.expect("start");
    assert_eq!(manager.job_count().await, 1);
    manager.stop().await;
}

#[tokio::test]
async fn scheduled_job_runs_ticks_until_stopped() {
    let driver = Arc::new(ScriptedDriver::new("hdsky"));
    driver.set_feed(vec![item("guid-1", "M1")]);
    driver.set_detail("guid-1", free_detail(64, Duration::hours(2)));

    let manager = manager(Arc::clone(&driver)).await;
    manager
        .reload(snapshot(vec![site("hdsky", vec![subscription("R1")])]))
        .await
        .expect("reload");

    // The first ticker fire is immediate; give the job a moment to run it.
    tokio::time::sleep(StdDuration::from_millis(300)).await;
    assert!(driver.fetch_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(driver.submit_calls.load(Ordering::SeqCst), 1);

    manager.stop().await;
    let calls_at_stop = driver.fetch_calls.load(Ordering::SeqCst);
    tokio::time::sleep(StdDuration::from_millis(200)).await;
    assert_eq!(
        driver.fetch_calls.load(Ordering::SeqCst),
        calls_at_stop,
        "no ticks after stop"
    );
}
