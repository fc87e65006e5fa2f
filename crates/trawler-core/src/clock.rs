//! Fixed tracker-local clock helpers.
//!
//! Private trackers render promotion deadlines in their own wall-clock zone
//! (UTC+8) with no offset marker. Every timestamp parsed from a tracker page
//! MUST go through this module so the stored instant is absolute; the system
//! zone is never consulted.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};

/// Offset of the tracker-local zone east of UTC, in seconds.
pub const SITE_LOCAL_OFFSET_SECS: i32 = 8 * 3_600;

/// The fixed zone trackers render timestamps in.
#[must_use]
pub fn site_local_zone() -> FixedOffset {
    FixedOffset::east_opt(SITE_LOCAL_OFFSET_SECS).expect("site-local offset is within range")
}

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];

/// Parse a tracker-local timestamp string into an absolute instant.
///
/// Accepts `YYYY-MM-DD HH:MM[:SS]` and bare `YYYY-MM-DD` (interpreted as
/// midnight tracker-local). Returns `None` when the text matches none of the
/// known shapes.
#[must_use]
pub fn parse_site_local(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let naive = DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })?;

    naive
        .and_local_timezone(site_local_zone())
        .single()
        .map(|instant| instant.with_timezone(&Utc))
}

/// Render an absolute instant in the tracker-local zone, for log lines that
/// are compared against tracker pages.
#[must_use]
pub fn format_site_local(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&site_local_zone())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_full_timestamp_as_utc_plus_eight() {
        let parsed = parse_site_local("2024-06-01 08:00:00").expect("timestamp should parse");
        let expected = Utc
            .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
            .single()
            .expect("valid instant");
        assert_eq!(parsed, expected);
    }

    #[test]
    fn parses_minute_precision_and_bare_date() {
        let minute = parse_site_local("2024-06-01 12:30").expect("minute precision should parse");
        assert_eq!(minute.with_timezone(&site_local_zone()).to_rfc3339(), {
            "2024-06-01T12:30:00+08:00".to_string()
        });

        let midnight = parse_site_local("2024-06-01").expect("bare date should parse");
        let expected = Utc
            .with_ymd_and_hms(2024, 5, 31, 16, 0, 0)
            .single()
            .expect("valid instant");
        assert_eq!(midnight, expected);
    }

    #[test]
    fn rejects_garbage_and_empty_input() {
        assert!(parse_site_local("").is_none());
        assert!(parse_site_local("   ").is_none());
        assert!(parse_site_local("soon(tm)").is_none());
    }

    #[test]
    fn round_trips_through_display_format() {
        let parsed = parse_site_local("2024-06-01 23:59:59").expect("timestamp should parse");
        assert_eq!(format_site_local(parsed), "2024-06-01 23:59:59");
    }
}
