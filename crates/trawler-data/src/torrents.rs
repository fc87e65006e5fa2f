//! The torrent journal: every observed candidate, its lifecycle, and the
//! archive of retired rows.
//!
//! Single-submission semantics hinge on `claim_for_submission`, a row-level
//! compare-and-set: the claim sentinel is taken in one conditional `UPDATE`,
//! so no application-level lock is ever held across store I/O.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use tracing::debug;

use trawler_core::model::{DiscountLevel, TorrentRecord};

use crate::db::Database;
use crate::error::{DataError, DataResult, QueryContext};

/// Default grace window after which an unconfirmed claim is released.
pub const CLAIM_GRACE_MINUTES: i64 = 10;

/// Result of an [`TorrentStore::upsert`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The record was inserted for the first time.
    Created,
    /// An existing row was refreshed (`last_seen`, discount, window
    /// extension).
    Merged,
    /// The re-observation reported the promotion was withdrawn and the
    /// unsubmitted row was retired immediately.
    Retired,
}

/// How ingest should treat an observed `(site, torrent)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    /// Never seen; ingest from scratch.
    Fresh,
    /// Live and not yet submitted; re-observation merges (and may extend
    /// the free window).
    LivePending,
    /// Submitted or archived; ingest skips it.
    Closed,
}

/// Repository for the `torrents` and `torrents_archive` tables.
#[derive(Clone)]
pub struct TorrentStore {
    db: Database,
}

#[derive(FromRow)]
struct TorrentRow {
    site_id: String,
    torrent_id: String,
    title: String,
    subscription: String,
    category: Option<String>,
    tag: Option<String>,
    download_url: String,
    size_mb: i64,
    discount: String,
    free_end_time: Option<DateTime<Utc>>,
    has_hr: bool,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    submitted: bool,
    submitted_at: Option<DateTime<Utc>>,
    downloader_hash: Option<String>,
    save_path: Option<String>,
    last_error: Option<String>,
    failure_count: i64,
    claimed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TorrentRow> for TorrentRecord {
    type Error = DataError;

    fn try_from(row: TorrentRow) -> Result<Self, Self::Error> {
        let discount: DiscountLevel = row.discount.parse().map_err(|err| DataError::Corrupt {
            detail: format!("{err}"),
        })?;
        Ok(Self {
            site_id: row.site_id,
            torrent_id: row.torrent_id,
            title: row.title,
            subscription: row.subscription,
            category: row.category,
            tag: row.tag,
            download_url: row.download_url,
            size_mb: u64::try_from(row.size_mb).unwrap_or_default(),
            discount,
            free_end_time: row.free_end_time,
            has_hr: row.has_hr,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            submitted: row.submitted,
            submitted_at: row.submitted_at,
            downloader_hash: row.downloader_hash,
            save_path: row.save_path,
            last_error: row.last_error,
            failure_count: u32::try_from(row.failure_count).unwrap_or_default(),
            claimed_at: row.claimed_at,
        })
    }
}

const SELECT_COLUMNS: &str = "site_id, torrent_id, title, subscription, category, tag, \
     download_url, size_mb, discount, free_end_time, has_hr, first_seen, last_seen, \
     submitted, submitted_at, downloader_hash, save_path, last_error, failure_count, claimed_at";

impl TorrentStore {
    /// Wrap the shared database handle.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Whether `(site, torrent)` was ever observed, consulting the live table
    /// and the archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub async fn exists(&self, site_id: &str, torrent_id: &str) -> DataResult<bool> {
        let live: i64 = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM torrents WHERE site_id = ?1 AND torrent_id = ?2) \
             OR EXISTS (SELECT 1 FROM torrents_archive WHERE site_id = ?1 AND torrent_id = ?2)",
        )
        .bind(site_id)
        .bind(torrent_id)
        .fetch_one(self.db.pool())
        .await
        .for_op("torrents.exists")?;
        Ok(live != 0)
    }

    /// Classify a key for ingest: unknown, live-pending, or closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookups fail.
    pub async fn ingest_state(&self, site_id: &str, torrent_id: &str) -> DataResult<IngestState> {
        let live: Option<bool> = sqlx::query_scalar(
            "SELECT submitted FROM torrents WHERE site_id = ?1 AND torrent_id = ?2",
        )
        .bind(site_id)
        .bind(torrent_id)
        .fetch_optional(self.db.pool())
        .await
        .for_op("torrents.ingest_state")?;
        if let Some(submitted) = live {
            return Ok(if submitted {
                IngestState::Closed
            } else {
                IngestState::LivePending
            });
        }

        let archived: i64 = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM torrents_archive WHERE site_id = ?1 AND torrent_id = ?2)",
        )
        .bind(site_id)
        .bind(torrent_id)
        .fetch_one(self.db.pool())
        .await
        .for_op("torrents.ingest_state")?;
        Ok(if archived == 0 {
            IngestState::Fresh
        } else {
            IngestState::Closed
        })
    }

    /// Fetch a live record.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails or the row is corrupt.
    pub async fn get(&self, site_id: &str, torrent_id: &str) -> DataResult<Option<TorrentRecord>> {
        let row = sqlx::query_as::<_, TorrentRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM torrents WHERE site_id = ?1 AND torrent_id = ?2"
        ))
        .bind(site_id)
        .bind(torrent_id)
        .fetch_optional(self.db.pool())
        .await
        .for_op("torrents.get")?;
        row.map(TorrentRecord::try_from).transpose()
    }

    /// Insert a fresh observation or merge a re-observation.
    ///
    /// Merging refreshes `last_seen` and the discount, and extends
    /// `free_end_time` monotonically (it never moves backwards). When
    /// `retire_on_discount_loss` is set and a previously free, unsubmitted
    /// row is re-observed without a promotion, the row is retired instead.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn upsert(
        &self,
        record: &TorrentRecord,
        retire_on_discount_loss: bool,
    ) -> DataResult<UpsertOutcome> {
        let mut tx = self.db.pool().begin().await.for_op("torrents.upsert")?;

        let existing = sqlx::query_as::<_, TorrentRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM torrents WHERE site_id = ?1 AND torrent_id = ?2"
        ))
        .bind(&record.site_id)
        .bind(&record.torrent_id)
        .fetch_optional(tx.as_mut())
        .await
        .for_op("torrents.upsert")?;

        let Some(existing) = existing else {
            sqlx::query(
                "INSERT INTO torrents (site_id, torrent_id, title, subscription, category, tag, \
                 download_url, size_mb, discount, free_end_time, has_hr, first_seen, last_seen, \
                 submitted, failure_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, 0)",
            )
            .bind(&record.site_id)
            .bind(&record.torrent_id)
            .bind(&record.title)
            .bind(&record.subscription)
            .bind(&record.category)
            .bind(&record.tag)
            .bind(&record.download_url)
            .bind(i64::try_from(record.size_mb).unwrap_or(i64::MAX))
            .bind(record.discount.as_str())
            .bind(record.free_end_time)
            .bind(record.has_hr)
            .bind(record.first_seen)
            .bind(record.last_seen)
            .execute(tx.as_mut())
            .await
            .for_op("torrents.upsert")?;
            tx.commit().await.for_op("torrents.upsert")?;
            return Ok(UpsertOutcome::Created);
        };

        let existing = TorrentRecord::try_from(existing)?;

        if retire_on_discount_loss
            && !existing.submitted
            && existing.discount.is_free()
            && record.discount == DiscountLevel::None
        {
            Self::archive_in_tx(
                tx.as_mut(),
                &record.site_id,
                &record.torrent_id,
                record.last_seen,
                "discount withdrawn",
            )
            .await?;
            tx.commit().await.for_op("torrents.upsert")?;
            debug!(
                site = %record.site_id,
                torrent = %record.torrent_id,
                "retired live record after promotion withdrawal"
            );
            return Ok(UpsertOutcome::Retired);
        }

        let free_end = match (existing.free_end_time, record.free_end_time) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => new.or(old),
        };
        sqlx::query(
            "UPDATE torrents SET last_seen = ?3, discount = ?4, free_end_time = ?5 \
             WHERE site_id = ?1 AND torrent_id = ?2",
        )
        .bind(&record.site_id)
        .bind(&record.torrent_id)
        .bind(record.last_seen)
        .bind(record.discount.as_str())
        .bind(free_end)
        .execute(tx.as_mut())
        .await
        .for_op("torrents.upsert")?;
        tx.commit().await.for_op("torrents.upsert")?;
        Ok(UpsertOutcome::Merged)
    }

    /// Atomically take the claim sentinel for a record.
    ///
    /// Succeeds iff the row is unsubmitted and either unclaimed or holding a
    /// claim older than the grace window. Returns the claimed record, or
    /// `None` when another worker holds the claim (or the row is gone).
    ///
    /// # Errors
    ///
    /// Returns an error if the update or the follow-up read fails.
    pub async fn claim_for_submission(
        &self,
        site_id: &str,
        torrent_id: &str,
        now: DateTime<Utc>,
    ) -> DataResult<Option<TorrentRecord>> {
        let stale_before = now - Duration::minutes(CLAIM_GRACE_MINUTES);
        let updated = sqlx::query(
            "UPDATE torrents SET claimed_at = ?3 \
             WHERE site_id = ?1 AND torrent_id = ?2 AND submitted = 0 \
               AND (claimed_at IS NULL OR claimed_at < ?4)",
        )
        .bind(site_id)
        .bind(torrent_id)
        .bind(now)
        .bind(stale_before)
        .execute(self.db.pool())
        .await
        .for_op("torrents.claim")?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(site_id, torrent_id).await
    }

    /// Record a successful submission: sets the submitted flag, timestamp,
    /// hash, and save path, and clears the claim.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn confirm_submission(
        &self,
        site_id: &str,
        torrent_id: &str,
        hash: &str,
        save_path: &str,
        now: DateTime<Utc>,
    ) -> DataResult<()> {
        sqlx::query(
            "UPDATE torrents SET submitted = 1, submitted_at = ?3, downloader_hash = ?4, \
             save_path = ?5, last_error = NULL, claimed_at = NULL \
             WHERE site_id = ?1 AND torrent_id = ?2",
        )
        .bind(site_id)
        .bind(torrent_id)
        .bind(now)
        .bind(hash)
        .bind(save_path)
        .execute(self.db.pool())
        .await
        .for_op("torrents.confirm")?;
        Ok(())
    }

    /// Record a failed submission attempt and release the claim.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn fail_submission(
        &self,
        site_id: &str,
        torrent_id: &str,
        error: &str,
    ) -> DataResult<()> {
        sqlx::query(
            "UPDATE torrents SET failure_count = failure_count + 1, last_error = ?3, \
             claimed_at = NULL \
             WHERE site_id = ?1 AND torrent_id = ?2",
        )
        .bind(site_id)
        .bind(torrent_id)
        .bind(error)
        .execute(self.db.pool())
        .await
        .for_op("torrents.fail")?;
        Ok(())
    }

    /// Release one claim without recording a failure, for claims abandoned
    /// before any submission attempt was made.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn release_claim(&self, site_id: &str, torrent_id: &str) -> DataResult<()> {
        sqlx::query(
            "UPDATE torrents SET claimed_at = NULL WHERE site_id = ?1 AND torrent_id = ?2",
        )
        .bind(site_id)
        .bind(torrent_id)
        .execute(self.db.pool())
        .await
        .for_op("torrents.release_claim")?;
        Ok(())
    }

    /// Release claims that were never confirmed within the grace window.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn release_stale_claims(&self, now: DateTime<Utc>) -> DataResult<u64> {
        let stale_before = now - Duration::minutes(CLAIM_GRACE_MINUTES);
        let released = sqlx::query(
            "UPDATE torrents SET claimed_at = NULL \
             WHERE submitted = 0 AND claimed_at IS NOT NULL AND claimed_at < ?1",
        )
        .bind(stale_before)
        .execute(self.db.pool())
        .await
        .for_op("torrents.release_stale")?;
        Ok(released.rows_affected())
    }

    /// Claim-eligible records whose free window still has at least
    /// `free_gate_hours` remaining (unbounded windows always qualify) and
    /// whose failure count is below `max_retry`, in first-seen order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn due_for_submission(
        &self,
        now: DateTime<Utc>,
        free_gate_hours: i64,
        max_retry: u32,
    ) -> DataResult<Vec<TorrentRecord>> {
        let gate = now + Duration::hours(free_gate_hours);
        let stale_before = now - Duration::minutes(CLAIM_GRACE_MINUTES);
        let rows = sqlx::query_as::<_, TorrentRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM torrents \
             WHERE submitted = 0 \
               AND (claimed_at IS NULL OR claimed_at < ?1) \
               AND failure_count < ?2 \
               AND (free_end_time IS NULL OR free_end_time >= ?3) \
             ORDER BY first_seen ASC, torrent_id ASC"
        ))
        .bind(stale_before)
        .bind(i64::from(max_retry))
        .bind(gate)
        .fetch_all(self.db.pool())
        .await
        .for_op("torrents.due")?;

        rows.into_iter().map(TorrentRecord::try_from).collect()
    }

    /// Move rows whose lifecycle ended into the archive: submitted rows
    /// older than `retain_hours`, and unsubmitted rows whose free window
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn retire(&self, now: DateTime<Utc>, retain_hours: i64) -> DataResult<u64> {
        let retain_before = now - Duration::hours(retain_hours);
        let mut tx = self.db.pool().begin().await.for_op("torrents.retire")?;

        let submitted = Self::archive_where_in_tx(
            tx.as_mut(),
            "submitted = 1 AND submitted_at IS NOT NULL AND submitted_at <= ?2",
            retain_before,
            now,
            "retention elapsed",
        )
        .await?;
        let expired = Self::archive_where_in_tx(
            tx.as_mut(),
            "submitted = 0 AND free_end_time IS NOT NULL AND free_end_time <= ?2",
            now,
            now,
            "free window expired",
        )
        .await?;

        tx.commit().await.for_op("torrents.retire")?;
        Ok(submitted + expired)
    }

    async fn archive_where_in_tx(
        conn: &mut sqlx::SqliteConnection,
        predicate: &str,
        bound: DateTime<Utc>,
        archived_at: DateTime<Utc>,
        reason: &str,
    ) -> DataResult<u64> {
        let insert = format!(
            "INSERT OR REPLACE INTO torrents_archive \
             (site_id, torrent_id, title, subscription, category, tag, download_url, size_mb, \
              discount, free_end_time, has_hr, first_seen, last_seen, submitted, submitted_at, \
              downloader_hash, save_path, last_error, failure_count, archived_at, archive_reason) \
             SELECT site_id, torrent_id, title, subscription, category, tag, download_url, \
              size_mb, discount, free_end_time, has_hr, first_seen, last_seen, submitted, \
              submitted_at, downloader_hash, save_path, last_error, failure_count, ?1, ?3 \
             FROM torrents WHERE {predicate}"
        );
        sqlx::query(&insert)
            .bind(archived_at)
            .bind(bound)
            .bind(reason)
            .execute(&mut *conn)
            .await
            .for_op("torrents.retire")?;

        let deleted = sqlx::query(&format!("DELETE FROM torrents WHERE {predicate}"))
            .bind(archived_at)
            .bind(bound)
            .execute(&mut *conn)
            .await
            .for_op("torrents.retire")?;
        Ok(deleted.rows_affected())
    }

    async fn archive_in_tx(
        conn: &mut sqlx::SqliteConnection,
        site_id: &str,
        torrent_id: &str,
        archived_at: DateTime<Utc>,
        reason: &str,
    ) -> DataResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO torrents_archive \
             (site_id, torrent_id, title, subscription, category, tag, download_url, size_mb, \
              discount, free_end_time, has_hr, first_seen, last_seen, submitted, submitted_at, \
              downloader_hash, save_path, last_error, failure_count, archived_at, archive_reason) \
             SELECT site_id, torrent_id, title, subscription, category, tag, download_url, \
              size_mb, discount, free_end_time, has_hr, first_seen, last_seen, submitted, \
              submitted_at, downloader_hash, save_path, last_error, failure_count, ?3, ?4 \
             FROM torrents WHERE site_id = ?1 AND torrent_id = ?2",
        )
        .bind(site_id)
        .bind(torrent_id)
        .bind(archived_at)
        .bind(reason)
        .execute(&mut *conn)
        .await
        .for_op("torrents.archive")?;
        sqlx::query("DELETE FROM torrents WHERE site_id = ?1 AND torrent_id = ?2")
            .bind(site_id)
            .bind(torrent_id)
            .execute(&mut *conn)
            .await
            .for_op("torrents.archive")?;
        Ok(())
    }

    /// Number of live rows, for reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the count fails.
    pub async fn live_count(&self) -> DataResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM torrents")
            .fetch_one(self.db.pool())
            .await
            .for_op("torrents.count")
    }
}
