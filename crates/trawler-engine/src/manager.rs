//! The scheduler: one ticker job per enabled subscription, reconciled
//! against configuration snapshots.
//!
//! Reloads are serialised and coalesced: concurrent callers park their
//! snapshot and only the newest parked snapshot is applied. Each job owns a
//! child cancellation scope and a serial execution lane; a tick still
//! running when the ticker fires swallows that fire instead of queueing it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trawler_config::{ConfigSnapshot, RssSubscription, SiteConfig};
use trawler_core::driver::SiteDriver;
use trawler_core::error::DriverResult;
use trawler_data::{Database, RateLimitConfig, SiteRateLimiter, TorrentStore};

use crate::error::{EngineError, EngineResult};
use crate::ingest::{TickContext, run_tick};
use crate::rules::RuleSet;

/// Builds a driver for a site, given its limiter. Injected so the engine
/// stays independent of concrete driver implementations.
pub type DriverFactory =
    Arc<dyn Fn(&SiteConfig, Arc<SiteRateLimiter>) -> DriverResult<Arc<dyn SiteDriver>> + Send + Sync>;

/// Scheduler lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// No jobs exist.
    Stopped,
    /// Initial snapshot is being applied.
    Starting,
    /// Jobs are live.
    Running,
    /// A snapshot is being reconciled.
    Reloading,
    /// Jobs are draining.
    Stopping,
}

/// Construction parameters for [`Manager`].
pub struct ManagerConfig {
    /// Shared database handle (rate-limit checkpoints).
    pub db: Database,
    /// The torrent journal.
    pub store: TorrentStore,
    /// Driver construction hook.
    pub driver_factory: DriverFactory,
    /// Per-site limiter parameters; sites not listed use the default.
    pub rate_limits: HashMap<String, RateLimitConfig>,
    /// How long [`Manager::stop`] waits for jobs to drain.
    pub shutdown_deadline: Duration,
}

type JobKey = (String, String);

#[derive(Clone, PartialEq, Eq)]
struct JobParams {
    interval: Duration,
    url: String,
    tag: Option<String>,
    sub_path: String,
}

struct Job {
    params: JobParams,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the lifecycle of every per-subscription ticker job.
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ManagerConfig,
    root: CancellationToken,
    state: std::sync::Mutex<ManagerState>,
    jobs: tokio::sync::Mutex<HashMap<JobKey, Job>>,
    pending: std::sync::Mutex<Option<ConfigSnapshot>>,
    reload_lane: tokio::sync::Mutex<()>,
    limiters: tokio::sync::Mutex<HashMap<String, Arc<SiteRateLimiter>>>,
}

impl Manager {
    /// Build an idle manager.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                root: CancellationToken::new(),
                state: std::sync::Mutex::new(ManagerState::Stopped),
                jobs: tokio::sync::Mutex::new(HashMap::new()),
                pending: std::sync::Mutex::new(None),
                reload_lane: tokio::sync::Mutex::new(()),
                limiters: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ManagerState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of live jobs.
    pub async fn job_count(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }

    /// Start scheduling iff auto-start is configured and a download root
    /// exists; otherwise stay idle awaiting an explicit reload.
    ///
    /// # Errors
    ///
    /// Propagates reload failures.
    pub async fn start(&self, snapshot: ConfigSnapshot) -> EngineResult<()> {
        if !snapshot.global.auto_start || snapshot.global.download_dir.trim().is_empty() {
            info!("auto-start disabled or download root unset; scheduler stays idle");
            return Ok(());
        }
        self.set_state(ManagerState::Starting);
        self.reload(snapshot).await
    }

    /// Reconcile the job set against `snapshot`.
    ///
    /// Serialised; concurrent callers park their snapshot and return, and
    /// only the newest parked snapshot is applied.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persist`] when limiter state cannot be read.
    /// Invalid entities are skipped and reported, not fatal.
    pub async fn reload(&self, snapshot: ConfigSnapshot) -> EngineResult<()> {
        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *pending = Some(snapshot);
        }

        // Whoever holds the lane drains every parked snapshot; losers
        // return knowing the holder will apply theirs (or a newer one).
        let Ok(_lane) = self.inner.reload_lane.try_lock() else {
            return Ok(());
        };

        loop {
            let next = {
                let mut pending = self
                    .inner
                    .pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                pending.take()
            };
            let Some(snapshot) = next else {
                break;
            };
            self.set_state(ManagerState::Reloading);
            self.apply(snapshot).await?;
            self.set_state(ManagerState::Running);
        }
        Ok(())
    }

    /// Cancel every job and wait for them to drain, abandoning stragglers
    /// at the shutdown deadline.
    pub async fn stop(&self) {
        self.set_state(ManagerState::Stopping);
        self.inner.root.cancel();

        let jobs: Vec<(JobKey, Job)> = {
            let mut jobs = self.inner.jobs.lock().await;
            jobs.drain().collect()
        };
        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_deadline;
        for (key, job) in jobs {
            job.cancel.cancel();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, job.handle).await.is_err() {
                warn!(site = %key.0, subscription = %key.1, "job missed the shutdown deadline; abandoning");
            }
        }

        let limiters = self.inner.limiters.lock().await;
        for limiter in limiters.values() {
            if let Err(error) = limiter.force_sync().await {
                warn!(site = %limiter.site_id(), error = %error, "final rate-limit checkpoint failed");
            }
        }
        self.set_state(ManagerState::Stopped);
    }

    fn set_state(&self, state: ManagerState) {
        let mut guard = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = state;
    }

    async fn limiter_for(&self, site: &SiteConfig) -> EngineResult<Arc<SiteRateLimiter>> {
        let mut limiters = self.inner.limiters.lock().await;
        if let Some(limiter) = limiters.get(&site.site_id) {
            return Ok(Arc::clone(limiter));
        }
        let config = self
            .inner
            .config
            .rate_limits
            .get(&site.site_id)
            .copied()
            .unwrap_or_default();
        let limiter = Arc::new(
            SiteRateLimiter::restore(
                self.inner.config.db.clone(),
                site.site_id.clone(),
                config,
                chrono::Utc::now(),
            )
            .await?,
        );
        limiters.insert(site.site_id.clone(), Arc::clone(&limiter));
        Ok(limiter)
    }

    async fn apply(&self, snapshot: ConfigSnapshot) -> EngineResult<()> {
        let rules = Arc::new(RuleSet::compile(&snapshot.rules));
        let mut target: HashMap<JobKey, (SiteConfig, RssSubscription, JobParams)> = HashMap::new();

        for site in snapshot.sites.iter().filter(|site| site.enabled) {
            for subscription in site.subscriptions.iter().filter(|sub| sub.enabled) {
                let key = (site.site_id.clone(), subscription.name.clone());
                if let Err(error) = validate_job(&snapshot, subscription) {
                    warn!(
                        site = %key.0,
                        subscription = %key.1,
                        error = %error,
                        "skipping job with invalid configuration"
                    );
                    continue;
                }
                let params = JobParams {
                    interval: subscription.effective_interval(&snapshot.global),
                    url: subscription.url.clone(),
                    tag: subscription.tag.clone(),
                    sub_path: subscription.download_sub_path.clone(),
                };
                target.insert(key, (site.clone(), subscription.clone(), params));
            }
        }

        let mut jobs = self.inner.jobs.lock().await;

        // Cancel jobs that vanished, were disabled, or changed parameters.
        let stale: Vec<JobKey> = jobs
            .iter()
            .filter(|(key, job)| {
                target
                    .get(*key)
                    .is_none_or(|(_, _, params)| *params != job.params)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(job) = jobs.remove(&key) {
                debug!(site = %key.0, subscription = %key.1, "cancelling job");
                job.cancel.cancel();
                job.handle.abort();
            }
        }

        // Start jobs that are new or restarted with changed parameters.
        for (key, (site, subscription, params)) in target {
            if jobs.contains_key(&key) {
                continue;
            }
            let limiter = self.limiter_for(&site).await?;
            let driver = match (self.inner.config.driver_factory)(&site, Arc::clone(&limiter)) {
                Ok(driver) => driver,
                Err(error) => {
                    warn!(
                        site = %key.0,
                        subscription = %key.1,
                        error = %error,
                        "skipping job; driver construction failed"
                    );
                    continue;
                }
            };
            let context = TickContext {
                site_id: site.site_id.clone(),
                subscription,
                site_subscriptions: site.subscriptions.clone(),
                global: snapshot.global.clone(),
                driver,
                limiter,
                store: self.inner.config.store.clone(),
                rules: Arc::clone(&rules),
            };
            let job = spawn_job(&self.inner.root, key.clone(), params, context);
            info!(site = %key.0, subscription = %key.1, "job started");
            jobs.insert(key, job);
        }
        Ok(())
    }
}

fn validate_job(snapshot: &ConfigSnapshot, subscription: &RssSubscription) -> EngineResult<()> {
    if snapshot.global.download_dir.trim().is_empty() {
        return Err(EngineError::Config {
            job: subscription.name.clone(),
            detail: "global download directory is unset".to_string(),
        });
    }
    if subscription.url.trim().is_empty() {
        return Err(EngineError::Config {
            job: subscription.name.clone(),
            detail: "subscription URL is empty".to_string(),
        });
    }
    Ok(())
}

fn spawn_job(
    root: &CancellationToken,
    _key: JobKey,
    params: JobParams,
    context: TickContext,
) -> Job {
    let cancel = root.child_token();
    let job_cancel = cancel.clone();
    let interval = params.interval;
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // A tick still in flight swallows the fires it missed.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = job_cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match run_tick(&context, &job_cancel).await {
                Ok(summary) => {
                    debug!(
                        site = %context.site_id,
                        subscription = %context.subscription.name,
                        ?summary,
                        "tick finished"
                    );
                }
                Err(error) if error.is_cancelled() => break,
                Err(error) => {
                    // Auth failures stay warn-level and the job stays
                    // alive: every subsequent tick fails fast until the
                    // configuration changes.
                    warn!(
                        site = %context.site_id,
                        subscription = %context.subscription.name,
                        error = %error,
                        "tick failed"
                    );
                }
            }
        }
        debug!(site = %context.site_id, subscription = %context.subscription.name, "job drained");
    });
    Job {
        params,
        cancel,
        handle,
    }
}

/// Run exactly one tick for every enabled subscription, without the
/// scheduler. The entry point for `--mode single`.
///
/// # Errors
///
/// Returns the first persistence error; driver failures are reported
/// per subscription and do not abort the fan-out.
pub async fn run_single(
    config: &ManagerConfig,
    snapshot: &ConfigSnapshot,
    cancel: &CancellationToken,
) -> EngineResult<Vec<((String, String), EngineResult<crate::ingest::TickSummary>)>> {
    let manager = Manager::new(ManagerConfig {
        db: config.db.clone(),
        store: config.store.clone(),
        driver_factory: Arc::clone(&config.driver_factory),
        rate_limits: config.rate_limits.clone(),
        shutdown_deadline: config.shutdown_deadline,
    });
    let rules = Arc::new(RuleSet::compile(&snapshot.rules));
    let mut outcomes = Vec::new();

    for site in snapshot.sites.iter().filter(|site| site.enabled) {
        let limiter = manager.limiter_for(site).await?;
        let driver = match (config.driver_factory)(site, Arc::clone(&limiter)) {
            Ok(driver) => driver,
            Err(error) => {
                warn!(site = %site.site_id, error = %error, "skipping site; driver construction failed");
                continue;
            }
        };
        for subscription in site.subscriptions.iter().filter(|sub| sub.enabled) {
            let key = (site.site_id.clone(), subscription.name.clone());
            let context = TickContext {
                site_id: site.site_id.clone(),
                subscription: subscription.clone(),
                site_subscriptions: site.subscriptions.clone(),
                global: snapshot.global.clone(),
                driver: Arc::clone(&driver),
                limiter: Arc::clone(&limiter),
                store: config.store.clone(),
                rules: Arc::clone(&rules),
            };
            let outcome = run_tick(&context, cancel).await;
            outcomes.push((key, outcome));
        }
    }

    let limiters = manager.inner.limiters.lock().await;
    for limiter in limiters.values() {
        if let Err(error) = limiter.force_sync().await {
            warn!(site = %limiter.site_id(), error = %error, "final rate-limit checkpoint failed");
        }
    }
    Ok(outcomes)
}
