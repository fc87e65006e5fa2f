//! The per-tick ingest pipeline.
//!
//! One tick for one subscription: fetch the feed, enrich unseen items with
//! detail (bounded parallelism, feed order preserved for persistence),
//! filter, persist, then run the deferred submission phase. Submission is
//! separated from ingest so a faster subscription cannot starve earlier
//! records and a downloader outage never blocks future ticks.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trawler_config::{GlobalSettings, RssSubscription};
use trawler_core::driver::{SiteDriver, SubmitRequest};
use trawler_core::error::DriverError;
use trawler_core::model::{FeedItem, TorrentDetail, TorrentRecord};
use trawler_data::{SiteRateLimiter, TorrentStore};

use crate::error::{EngineError, EngineResult};
use crate::rules::{Candidate, RuleSet, Verdict};

/// Detail lookups in flight at once within one tick.
const ENRICH_PARALLELISM: usize = 4;

/// Everything one tick needs.
pub struct TickContext {
    /// Site the subscription belongs to.
    pub site_id: String,
    /// The subscription being ticked.
    pub subscription: RssSubscription,
    /// Every subscription of the site, for resolving save paths of due
    /// records observed through sibling feeds.
    pub site_subscriptions: Vec<RssSubscription>,
    /// Global settings snapshot.
    pub global: GlobalSettings,
    /// The site's driver.
    pub driver: Arc<dyn SiteDriver>,
    /// The site's persistent rate limiter.
    pub limiter: Arc<SiteRateLimiter>,
    /// The torrent journal.
    pub store: TorrentStore,
    /// Compiled filter rules.
    pub rules: Arc<RuleSet>,
}

/// Counters for one tick, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Items the feed exposed.
    pub fetched: usize,
    /// Items already known (live or archived).
    pub duplicates: usize,
    /// Items persisted this tick.
    pub ingested: usize,
    /// Items dropped by rules, size ceiling, or parse failures.
    pub skipped: usize,
    /// Records handed to the downloader this tick.
    pub submitted: usize,
    /// Submissions that failed this tick.
    pub submit_failures: usize,
}

/// Run one tick of the ingest pipeline.
///
/// # Errors
///
/// Returns [`EngineError::Driver`] when the feed fetch fails (auth
/// failures fail fast until configuration changes), [`EngineError::Persist`]
/// on store I/O failure, and [`EngineError::Cancelled`] when the scope is
/// cancelled.
pub async fn run_tick(ctx: &TickContext, cancel: &CancellationToken) -> EngineResult<TickSummary> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    if !ctx.limiter.wait(cancel).await? {
        return Err(EngineError::Cancelled);
    }

    let mut summary = TickSummary::default();
    let items = ctx.driver.fetch_rss(cancel, &ctx.subscription.url).await?;
    summary.fetched = items.len();
    debug!(
        site = %ctx.site_id,
        subscription = %ctx.subscription.name,
        items = items.len(),
        "feed fetched"
    );

    let fresh = filter_unseen(ctx, items, &mut summary).await?;
    let enriched = enrich(ctx, cancel, fresh).await;

    for ((item, relisted), outcome) in enriched {
        let detail = match outcome {
            Ok(detail) => detail,
            Err(DriverError::Cancelled) => return Err(EngineError::Cancelled),
            Err(error @ DriverError::Auth { .. }) => return Err(error.into()),
            Err(error) => {
                // Parse and exhausted-transient failures skip the item;
                // it will be re-observed on a later tick.
                warn!(
                    site = %ctx.site_id,
                    subscription = %ctx.subscription.name,
                    item = %item.id,
                    error = %error,
                    "skipping item after detail failure"
                );
                summary.skipped += 1;
                continue;
            }
        };

        if !admit(ctx, &item, &detail) {
            // A rejected re-observation still merges so a withdrawn
            // promotion reaches the stored row (and may retire it).
            if relisted {
                let record = TorrentRecord::from_observation(
                    &ctx.site_id,
                    &ctx.subscription.name,
                    ctx.subscription.tag.as_deref(),
                    &item,
                    &detail,
                    Utc::now(),
                );
                ctx.store
                    .upsert(&record, ctx.global.retire_on_discount_loss)
                    .await?;
            }
            summary.skipped += 1;
            continue;
        }

        // A fresh "now" per item keeps first-seen ordering aligned with
        // feed order, which the submission phase sorts by.
        let record = TorrentRecord::from_observation(
            &ctx.site_id,
            &ctx.subscription.name,
            ctx.subscription.tag.as_deref(),
            &item,
            &detail,
            Utc::now(),
        );
        ctx.store
            .upsert(&record, ctx.global.retire_on_discount_loss)
            .await?;
        summary.ingested += 1;
    }

    submit_due(ctx, cancel, &mut summary).await?;

    ctx.store
        .retire(Utc::now(), i64::from(ctx.global.retain_hours))
        .await?;

    info!(
        site = %ctx.site_id,
        subscription = %ctx.subscription.name,
        fetched = summary.fetched,
        ingested = summary.ingested,
        submitted = summary.submitted,
        "tick complete"
    );
    Ok(summary)
}

/// Drop items whose lifecycle already closed (submitted or archived).
/// Live, unsubmitted rows pass through flagged as re-observations: the
/// merge refreshes `last_seen` and may extend or withdraw the free window.
async fn filter_unseen(
    ctx: &TickContext,
    items: Vec<FeedItem>,
    summary: &mut TickSummary,
) -> EngineResult<Vec<(FeedItem, bool)>> {
    let mut fresh = Vec::with_capacity(items.len());
    for item in items {
        match ctx.store.ingest_state(&ctx.site_id, &item.id).await? {
            trawler_data::IngestState::Closed => summary.duplicates += 1,
            trawler_data::IngestState::Fresh => fresh.push((item, false)),
            trawler_data::IngestState::LivePending => fresh.push((item, true)),
        }
    }
    Ok(fresh)
}

/// Resolve details with bounded parallelism; the output preserves feed
/// order so persistence and submission stay ordered within the tick.
async fn enrich(
    ctx: &TickContext,
    cancel: &CancellationToken,
    items: Vec<(FeedItem, bool)>,
) -> Vec<((FeedItem, bool), Result<TorrentDetail, DriverError>)> {
    futures::stream::iter(items)
        .map(|(item, relisted)| async move {
            let detail = ctx.driver.resolve_detail(cancel, &item).await;
            ((item, relisted), detail)
        })
        .buffered(ENRICH_PARALLELISM)
        .collect()
        .await
}

/// Rule verdict plus the global size ceiling. The free-window gate is
/// enforced at claim time, not here, so a short window still persists and
/// can be extended by a later observation.
fn admit(ctx: &TickContext, item: &FeedItem, detail: &TorrentDetail) -> bool {
    let candidate = Candidate {
        site_id: &ctx.site_id,
        subscription: &ctx.subscription.name,
        title: &item.title,
        tag: ctx.subscription.tag.as_deref(),
        discount: detail.discount,
    };
    let verdict = match ctx.rules.decide(&candidate) {
        Verdict::NoMatch => {
            if detail.discount.is_free() {
                Verdict::Accept
            } else {
                Verdict::Reject
            }
        }
        decided => decided,
    };
    if verdict == Verdict::Reject {
        debug!(
            site = %ctx.site_id,
            item = %item.id,
            discount = %detail.discount,
            "rejected by rules"
        );
        return false;
    }

    let ceiling_mb = u64::from(ctx.global.torrent_size_gb) * 1_024;
    if detail.size_mb > ceiling_mb {
        debug!(
            site = %ctx.site_id,
            item = %item.id,
            size_mb = detail.size_mb,
            ceiling_mb,
            "skipping oversize torrent"
        );
        return false;
    }
    true
}

async fn submit_due(
    ctx: &TickContext,
    cancel: &CancellationToken,
    summary: &mut TickSummary,
) -> EngineResult<()> {
    let now = Utc::now();
    ctx.store.release_stale_claims(now).await?;

    let due = ctx
        .store
        .due_for_submission(
            now,
            i64::from(ctx.global.free_gate_hours),
            ctx.global.max_retry,
        )
        .await?;

    for record in due.into_iter().filter(|record| record.site_id == ctx.site_id) {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(claimed) = ctx
            .store
            .claim_for_submission(&record.site_id, &record.torrent_id, Utc::now())
            .await?
        else {
            continue;
        };

        // Double-check the gate at claim time; the due query and the claim
        // are not one atomic step.
        if claimed
            .free_remaining(Utc::now())
            .is_some_and(|left| left < Duration::hours(i64::from(ctx.global.free_gate_hours)))
        {
            ctx.store
                .release_claim(&record.site_id, &record.torrent_id)
                .await?;
            continue;
        }

        let request = submit_request(ctx, &claimed);
        match ctx.driver.submit_to_downloader(cancel, &request).await {
            Ok(hash) => {
                ctx.store
                    .confirm_submission(
                        &record.site_id,
                        &record.torrent_id,
                        &hash,
                        &request.save_path,
                        Utc::now(),
                    )
                    .await?;
                summary.submitted += 1;
                info!(
                    site = %ctx.site_id,
                    torrent = %record.torrent_id,
                    hash = %hash,
                    save_path = %request.save_path,
                    "submitted to downloader"
                );
            }
            Err(DriverError::Cancelled) => return Err(EngineError::Cancelled),
            Err(error) => {
                summary.submit_failures += 1;
                warn!(
                    site = %ctx.site_id,
                    torrent = %record.torrent_id,
                    error = %error,
                    "submission failed"
                );
                ctx.store
                    .fail_submission(&record.site_id, &record.torrent_id, &error.to_string())
                    .await?;
            }
        }
    }
    Ok(())
}

fn submit_request(ctx: &TickContext, record: &TorrentRecord) -> SubmitRequest {
    let sub_path = ctx
        .site_subscriptions
        .iter()
        .find(|subscription| subscription.name == record.subscription)
        .map_or(ctx.subscription.download_sub_path.as_str(), |subscription| {
            subscription.download_sub_path.as_str()
        });
    let save_path = join_save_path(&ctx.global.download_dir, sub_path);

    let mut request = SubmitRequest::for_record(record, save_path);
    if ctx.global.speed_limit_enabled && ctx.global.speed_limit_mbps > 0.0 {
        let bps = ctx.global.speed_limit_mbps * 1_024.0 * 1_024.0;
        if bps.is_finite() && bps >= 1.0 {
            #[allow(clippy::cast_possible_truncation)]
            let bps = bps as i64;
            request.upload_limit_bps = Some(bps);
            request.download_limit_bps = Some(bps);
        }
    }
    request
}

fn join_save_path(root: &str, sub_path: &str) -> String {
    if sub_path.is_empty() {
        return root.to_string();
    }
    let trimmed_root = root.trim_end_matches('/');
    format!("{trimmed_root}/{sub_path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_paths_join_without_doubled_separators() {
        assert_eq!(join_save_path("/tmp/d", "hdsky/"), "/tmp/d/hdsky/");
        assert_eq!(join_save_path("/tmp/d/", "hdsky/"), "/tmp/d/hdsky/");
        assert_eq!(join_save_path("/tmp/d", ""), "/tmp/d");
    }
}
