//! Per-site fixed-window rate limiting with durable checkpoints.
//!
//! The counter lives in memory behind a mutex; the guard is never held
//! across I/O. Checkpoints flow to the `site_rate_limits` table at a bounded
//! rate and on `force_sync`, so a restart inside a window resumes the count
//! instead of resetting it.

use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::{DataResult, QueryContext};

/// Flush to storage after this many un-checkpointed increments.
const CHECKPOINT_EVERY: u32 = 5;
/// Flush to storage when the last checkpoint is older than this.
const CHECKPOINT_INTERVAL_SECS: i64 = 15;

/// Static window parameters for one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub limit: u32,
    /// Window length.
    pub window: StdDuration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window: StdDuration::from_secs(60),
        }
    }
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Allows left in the current window.
    pub remaining: u32,
    /// Instant the current window closes and the count resets.
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: DateTime<Utc>,
    count: u32,
    unsynced: u32,
    last_checkpoint: DateTime<Utc>,
}

#[derive(FromRow)]
struct CheckpointRow {
    window_start: DateTime<Utc>,
    request_count: i64,
    request_limit: i64,
    window_secs: i64,
}

/// Durable fixed-window limiter for a single site.
pub struct SiteRateLimiter {
    site_id: String,
    config: RateLimitConfig,
    state: Mutex<WindowState>,
    db: Database,
}

impl SiteRateLimiter {
    /// Build a limiter, restoring the persisted window when it is still
    /// live and was recorded with the same parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint row cannot be read.
    pub async fn restore(
        db: Database,
        site_id: impl Into<String>,
        config: RateLimitConfig,
        now: DateTime<Utc>,
    ) -> DataResult<Self> {
        let site_id = site_id.into();
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT window_start, request_count, request_limit, window_secs \
             FROM site_rate_limits WHERE site_id = ?1",
        )
        .bind(&site_id)
        .fetch_optional(db.pool())
        .await
        .for_op("limiter.restore")?;

        let window = chrono_window(config.window);
        let state = match row {
            Some(row)
                if row.request_limit == i64::from(config.limit)
                    && row.window_secs == window.num_seconds()
                    && now - row.window_start < window =>
            {
                debug!(
                    site = %site_id,
                    count = row.request_count,
                    "restored rate-limit window from checkpoint"
                );
                WindowState {
                    window_start: row.window_start,
                    count: u32::try_from(row.request_count).unwrap_or(config.limit),
                    unsynced: 0,
                    last_checkpoint: now,
                }
            }
            _ => WindowState {
                window_start: now,
                count: 0,
                unsynced: 0,
                last_checkpoint: now,
            },
        };

        Ok(Self {
            site_id,
            config,
            state: Mutex::new(state),
            db,
        })
    }

    /// Site this limiter guards.
    #[must_use]
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Try to take one allowance at `now`. Resets the window when the wall
    /// clock left it. May flush a checkpoint after the guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if a due checkpoint write fails; the in-memory
    /// decision itself cannot fail.
    pub async fn allow_at(&self, now: DateTime<Utc>) -> DataResult<bool> {
        let (granted, checkpoint) = {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let window = chrono_window(self.config.window);
            if now - state.window_start >= window {
                state.window_start = now;
                state.count = 0;
            }
            let granted = state.count < self.config.limit;
            if granted {
                state.count += 1;
                state.unsynced += 1;
            }
            let due = state.unsynced >= CHECKPOINT_EVERY
                || (state.unsynced > 0
                    && now - state.last_checkpoint
                        >= Duration::seconds(CHECKPOINT_INTERVAL_SECS));
            if due {
                state.unsynced = 0;
                state.last_checkpoint = now;
                (granted, Some(*state))
            } else {
                (granted, None)
            }
        };

        if let Some(snapshot) = checkpoint {
            self.write_checkpoint(snapshot, now).await?;
        }
        Ok(granted)
    }

    /// Try to take one allowance at the current wall clock.
    ///
    /// # Errors
    ///
    /// Returns an error if a due checkpoint write fails.
    pub async fn allow(&self) -> DataResult<bool> {
        self.allow_at(Utc::now()).await
    }

    /// Take an allowance, sleeping across window boundaries until one is
    /// granted or `cancel` fires.
    ///
    /// Returns `false` when cancelled, `true` once an allowance was taken.
    ///
    /// # Errors
    ///
    /// Returns an error if a checkpoint write fails.
    pub async fn wait(&self, cancel: &CancellationToken) -> DataResult<bool> {
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let now = Utc::now();
            if self.allow_at(now).await? {
                return Ok(true);
            }
            let reset_at = self.stats_at(now).reset_at;
            let sleep_for = (reset_at - now).to_std().unwrap_or(StdDuration::ZERO);
            debug!(site = %self.site_id, sleep_ms = u64::try_from(sleep_for.as_millis()).unwrap_or(u64::MAX), "rate limited; waiting for next window");
            tokio::select! {
                () = cancel.cancelled() => return Ok(false),
                () = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Remaining allowance and reset instant at `now`.
    #[must_use]
    pub fn stats_at(&self, now: DateTime<Utc>) -> RateLimiterStats {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let window = chrono_window(self.config.window);
        if now - state.window_start >= window {
            return RateLimiterStats {
                remaining: self.config.limit,
                reset_at: now + window,
            };
        }
        RateLimiterStats {
            remaining: self.config.limit.saturating_sub(state.count),
            reset_at: state.window_start + window,
        }
    }

    /// Flush the current window to storage unconditionally.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn force_sync(&self) -> DataResult<()> {
        let now = Utc::now();
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.unsynced = 0;
            state.last_checkpoint = now;
            *state
        };
        self.write_checkpoint(snapshot, now).await
    }

    /// Reset the window and persist the empty state.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn reset(&self) -> DataResult<()> {
        let now = Utc::now();
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.window_start = now;
            state.count = 0;
            state.unsynced = 0;
            state.last_checkpoint = now;
            *state
        };
        self.write_checkpoint(snapshot, now).await
    }

    async fn write_checkpoint(&self, state: WindowState, now: DateTime<Utc>) -> DataResult<()> {
        let window = chrono_window(self.config.window);
        let result = sqlx::query(
            "INSERT INTO site_rate_limits \
             (site_id, window_start, request_count, request_limit, window_secs, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (site_id) DO UPDATE SET window_start = excluded.window_start, \
             request_count = excluded.request_count, request_limit = excluded.request_limit, \
             window_secs = excluded.window_secs, updated_at = excluded.updated_at",
        )
        .bind(&self.site_id)
        .bind(state.window_start)
        .bind(i64::from(state.count))
        .bind(i64::from(self.config.limit))
        .bind(window.num_seconds())
        .bind(now)
        .execute(self.db.pool())
        .await
        .for_op("limiter.checkpoint");
        if let Err(error) = &result {
            warn!(site = %self.site_id, error = %error, "rate-limit checkpoint failed");
        }
        result.map(|_| ())
    }
}

fn chrono_window(window: StdDuration) -> Duration {
    Duration::from_std(window).unwrap_or_else(|_| Duration::seconds(60))
}
