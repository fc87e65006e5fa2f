//! Text normalisation helpers for tracker pages.
//!
//! Tracker markup renders numbers with thousands separators and sizes with
//! binary unit suffixes; everything here is lenient about surrounding
//! whitespace and case.

/// Parse a human-readable payload size (`"12.5 TB"`, `"700 MiB"`) to bytes.
#[must_use]
pub fn parse_size_bytes(text: &str) -> Option<u64> {
    let cleaned = text.trim().replace(',', "");
    let split = cleaned
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(cleaned.len());
    let (number, unit) = cleaned.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    if value < 0.0 {
        return None;
    }

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "B" | "" => 1,
        "KB" | "KIB" | "K" => 1_024,
        "MB" | "MIB" | "M" => 1_024_u64.pow(2),
        "GB" | "GIB" | "G" => 1_024_u64.pow(3),
        "TB" | "TIB" | "T" => 1_024_u64.pow(4),
        "PB" | "PIB" | "P" => 1_024_u64.pow(5),
        _ => return None,
    };
    float_to_bytes(value, multiplier)
}

fn float_to_bytes(value: f64, multiplier: u64) -> Option<u64> {
    let scaled = value * multiplier_as_f64(multiplier);
    if scaled.is_finite() && scaled >= 0.0 && scaled < u64_as_f64(u64::MAX) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(scaled as u64)
    } else {
        None
    }
}

const fn multiplier_as_f64(value: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        value as f64
    }
}

const fn u64_as_f64(value: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        value as f64
    }
}

/// Bytes to whole mebibytes, rounding up so a 1-byte torrent is not "0 MB".
#[must_use]
pub const fn bytes_to_mb(bytes: u64) -> u64 {
    bytes.div_ceil(1_024 * 1_024)
}

/// Parse a tracker-rendered decimal (`"1,234.56"`, `"∞"` is `None`).
#[must_use]
pub fn parse_decimal(text: &str) -> Option<f64> {
    let cleaned = text.trim().replace(',', "");
    cleaned.parse().ok()
}

/// Parse a tracker-rendered integer count.
#[must_use]
pub fn parse_count(text: &str) -> Option<u64> {
    let cleaned = text.trim().replace(',', "");
    cleaned.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_parse_with_binary_units() {
        assert_eq!(parse_size_bytes("64 MB"), Some(64 * 1_024 * 1_024));
        assert_eq!(parse_size_bytes("1.5 GiB"), Some(1_610_612_736));
        assert_eq!(parse_size_bytes("12.5 TB"), Some(13_743_895_347_200));
        assert_eq!(parse_size_bytes("1,024 KB"), Some(1_024 * 1_024));
        assert_eq!(parse_size_bytes("512"), Some(512));
        assert_eq!(parse_size_bytes("oops"), None);
        assert_eq!(parse_size_bytes("-3 GB"), None);
    }

    #[test]
    fn byte_to_mb_rounds_up() {
        assert_eq!(bytes_to_mb(0), 0);
        assert_eq!(bytes_to_mb(1), 1);
        assert_eq!(bytes_to_mb(1_024 * 1_024), 1);
        assert_eq!(bytes_to_mb(1_024 * 1_024 + 1), 2);
    }

    #[test]
    fn decimals_tolerate_thousands_separators() {
        assert_eq!(parse_decimal("1,234.56"), Some(1_234.56));
        assert_eq!(parse_decimal(" 3.14 "), Some(3.14));
        assert_eq!(parse_decimal("∞"), None);
        assert_eq!(parse_count("2,048"), Some(2_048));
    }
}
