//! Database maintenance: legacy timezone repair and online backups.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::info;

use trawler_core::clock::site_local_zone;

use crate::db::Database;
use crate::error::{DataError, DataResult, QueryContext};

/// One row rewritten (or, under `dry_run`, that would be rewritten) by
/// [`repair_timezone`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimezoneRepair {
    /// Owning site identifier.
    pub site_id: String,
    /// Site-scoped torrent identifier.
    pub torrent_id: String,
    /// Stored text before the repair.
    pub before: String,
    /// Absolute instant after reinterpretation in the tracker-local zone.
    pub after: DateTime<Utc>,
}

/// Reinterpret legacy `free_end_time` values that were stored without an
/// offset (and therefore read back as UTC) in the fixed tracker-local zone.
///
/// Rows written by current code always carry an offset and are left alone.
/// With `dry_run` the affected rows are reported but not rewritten.
///
/// # Errors
///
/// Returns an error if the scan or a rewrite fails.
pub async fn repair_timezone(db: &Database, dry_run: bool) -> DataResult<Vec<TimezoneRepair>> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT site_id, torrent_id, free_end_time FROM torrents \
         WHERE free_end_time IS NOT NULL",
    )
    .fetch_all(db.pool())
    .await
    .for_op("maintenance.repair_timezone")?;

    let mut repairs = Vec::new();
    for (site_id, torrent_id, stored) in rows {
        let Some(naive) = naive_without_offset(&stored) else {
            continue;
        };
        let Some(reinterpreted) = naive.and_local_timezone(site_local_zone()).single() else {
            return Err(DataError::Corrupt {
                detail: format!("ambiguous legacy timestamp '{stored}'"),
            });
        };
        repairs.push(TimezoneRepair {
            site_id,
            torrent_id,
            before: stored,
            after: reinterpreted.with_timezone(&Utc),
        });
    }

    if dry_run {
        info!(rows = repairs.len(), "timezone repair dry run");
        return Ok(repairs);
    }

    for repair in &repairs {
        sqlx::query(
            "UPDATE torrents SET free_end_time = ?3 WHERE site_id = ?1 AND torrent_id = ?2",
        )
        .bind(&repair.site_id)
        .bind(&repair.torrent_id)
        .bind(repair.after)
        .execute(db.pool())
        .await
        .for_op("maintenance.repair_timezone")?;
    }
    info!(rows = repairs.len(), "timezone repair applied");
    Ok(repairs)
}

/// A stored text is "legacy" when it parses as a naive timestamp, i.e. it
/// carries no offset suffix or zulu marker.
fn naive_without_offset(stored: &str) -> Option<NaiveDateTime> {
    let trimmed = stored.trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive);
        }
    }
    None
}

/// Write a consistent snapshot of the live database to `dest` via
/// `VACUUM INTO`.
///
/// # Errors
///
/// Returns an error if the destination path is not valid UTF-8 or the
/// vacuum fails.
pub async fn backup(db: &Database, dest: &Path) -> DataResult<()> {
    let Some(dest_str) = dest.to_str() else {
        return Err(DataError::Corrupt {
            detail: format!("backup path is not valid UTF-8: {}", dest.display()),
        });
    };
    sqlx::query("VACUUM INTO ?1")
        .bind(dest_str)
        .execute(db.pool())
        .await
        .for_op("maintenance.backup")?;
    info!(dest = %dest.display(), "database backup written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn seed_row(db: &Database, torrent_id: &str, free_end_text: &str) {
        sqlx::query(
            "INSERT INTO torrents (site_id, torrent_id, title, subscription, download_url, \
             discount, free_end_time, first_seen, last_seen) \
             VALUES ('hdsky', ?1, 'title', 'R1', 'https://x/dl', 'free', ?2, ?3, ?3)",
        )
        .bind(torrent_id)
        .bind(free_end_text)
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .expect("seed row");
    }

    #[tokio::test]
    async fn repairs_only_offsetless_rows() {
        let db = Database::open_in_memory().await.expect("db");
        seed_row(&db, "legacy", "2024-06-01 08:00:00").await;
        seed_row(&db, "modern", "2024-06-01 08:00:00+08:00").await;

        let repairs = repair_timezone(&db, false).await.expect("repair");
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].torrent_id, "legacy");
        let expected = Utc
            .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
            .single()
            .expect("instant");
        assert_eq!(repairs[0].after, expected);

        // The rewritten value now reads back as the correct instant.
        let stored: DateTime<Utc> = sqlx::query_scalar(
            "SELECT free_end_time FROM torrents WHERE torrent_id = 'legacy'",
        )
        .fetch_one(db.pool())
        .await
        .expect("read back");
        assert_eq!(stored, expected);

        // Re-running finds nothing left to repair.
        let again = repair_timezone(&db, false).await.expect("repair");
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn dry_run_reports_without_rewriting() {
        let db = Database::open_in_memory().await.expect("db");
        seed_row(&db, "legacy", "2024-06-01 08:00:00").await;

        let repairs = repair_timezone(&db, true).await.expect("dry run");
        assert_eq!(repairs.len(), 1);

        let stored: String =
            sqlx::query_scalar("SELECT free_end_time FROM torrents WHERE torrent_id = 'legacy'")
                .fetch_one(db.pool())
                .await
                .expect("read back");
        assert_eq!(stored, "2024-06-01 08:00:00");
    }

    #[tokio::test]
    async fn backup_writes_a_queryable_copy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&temp.path().join("live.db"))
            .await
            .expect("db");
        seed_row(&db, "kept", "2024-06-01 08:00:00+08:00").await;

        let dest = temp.path().join("backup.db");
        backup(&db, &dest).await.expect("backup");
        db.close().await;

        let copy = Database::open(&dest).await.expect("open backup");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM torrents")
            .fetch_one(copy.pool())
            .await
            .expect("count");
        assert_eq!(count, 1);
        copy.close().await;
    }
}
