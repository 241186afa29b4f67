//! Canonical forms for free-text spreadsheet fields.
//!
//! Every function here is total: malformed input degrades to a best-effort
//! string (or 0 for premiums) and never panics. Callers compare and hash the
//! outputs, so the exact output shape is part of the on-disk identity scheme.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use unicode_normalization::UnicodeNormalization;

/// Mask wildcard kept by name normalization.
pub const MASK_WILDCARD: char = '*';

/// Cell values that spreadsheet exports use to mean "nothing here".
fn is_null_marker(s: &str) -> bool {
    s.is_empty() || s.eq_ignore_ascii_case("nan") || s.eq_ignore_ascii_case("none")
}

/// Digits only. Empty input yields an empty string.
pub fn normalize_phone(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Last four digits of a phone number, or empty when fewer than four exist.
pub fn phone_last4(s: &str) -> String {
    let digits = normalize_phone(s);
    if digits.len() < 4 {
        return String::new();
    }
    digits[digits.len() - 4..].to_string()
}

/// Trim, collapse internal whitespace, lowercase.
pub fn normalize_text(s: &str) -> String {
    let trimmed = s.trim();
    if is_null_marker(trimmed) {
        return String::new();
    }
    trimmed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Name with all whitespace removed (NFC-composed). This is the form stored in
/// `customers.name` and used for display-level equality.
pub fn compact_name(s: &str) -> String {
    s.nfc().filter(|c| !c.is_whitespace()).collect()
}

/// Comparison key for names: lowercase, alphanumerics (any script) plus the
/// mask wildcard, nothing else.
pub fn normalize_name_for_key(s: &str) -> String {
    normalize_text(s)
        .nfc()
        .filter(|c| c.is_alphanumeric() || *c == MASK_WILDCARD)
        .collect()
}

/// Up to eight digits (YYYYMMDD). Partial dates are kept as-is.
pub fn normalize_birth(s: &str) -> String {
    let digits = normalize_phone(s);
    if digits.len() >= 8 {
        digits[..8].to_string()
    } else {
        digits
    }
}

/// Alphanumerics only, uppercased. `"ab-123 "` and `"AB123"` compare equal.
pub fn normalize_policy_no(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d", "%Y. %m. %d", "%Y%m%d"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"];

/// Spreadsheet serial day numbers that plausibly encode a date (1954..2064).
const EXCEL_SERIAL_RANGE: std::ops::RangeInclusive<f64> = 20000.0..=60000.0;

/// `YYYY-MM-DD` when the input can be read as a date, otherwise a degraded
/// but stable string.
///
/// Order: structured parse (common date and datetime layouts, spreadsheet
/// serial numbers), then the first eight digits reformatted, then the
/// whitespace-stripped lowercase input.
pub fn normalize_date(s: &str) -> String {
    let trimmed = s.trim();
    if is_null_marker(trimmed) {
        return String::new();
    }

    if let Some(date) = parse_date(trimmed) {
        return date.format("%Y-%m-%d").to_string();
    }

    let digits = normalize_phone(trimmed);
    if digits.len() >= 8 {
        return format!("{}-{}-{}", &digits[0..4], &digits[4..6], &digits[6..8]);
    }

    trimmed
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    if let Ok(serial) = s.parse::<f64>() {
        if EXCEL_SERIAL_RANGE.contains(&serial) {
            let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
            return epoch.checked_add_signed(Duration::days(serial.trunc() as i64));
        }
    }
    None
}

/// Digits parsed as an integer; empty or overflowing input yields 0.
pub fn normalize_premium(s: &str) -> i64 {
    // "35,000.00" is thirty-five thousand, not three and a half million
    let integral = match s.find('.') {
        Some(pos) if s[pos + 1..].chars().all(|c| c.is_ascii_digit() || c.is_whitespace()) => {
            &s[..pos]
        }
        _ => s,
    };
    normalize_phone(integral).parse::<i64>().unwrap_or(0)
}

/// Borrow a field as `&str`, treating `None` as empty.
pub fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

/// `Some(trimmed)` only when the field carries a non-blank value.
pub fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !is_null_marker(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phone_digits_only() {
        assert_eq!(normalize_phone("010-1234-5678"), "01012345678");
        assert_eq!(normalize_phone("(02) 555 0101"), "025550101");
        assert_eq!(normalize_phone(""), "");
        assert_eq!(normalize_phone("없음"), "");
        assert_eq!(phone_last4("010-1234-5678"), "5678");
        assert_eq!(phone_last4("123"), "");
    }

    #[test]
    fn test_name_key() {
        assert_eq!(normalize_name_for_key("  홍 길동 "), "홍길동");
        assert_eq!(normalize_name_for_key("John  O'Neil"), "johnoneil");
        assert_eq!(normalize_name_for_key("홍*동"), "홍*동");
        assert_eq!(normalize_name_for_key("nan"), "");
        assert_eq!(compact_name(" 노 일용 "), "노일용");
    }

    #[test]
    fn test_name_key_composes_decomposed_hangul() {
        let decomposed: String = "홍길동".nfd().collect();
        assert_ne!(decomposed, "홍길동");
        assert_eq!(normalize_name_for_key(&decomposed), "홍길동");
    }

    #[test]
    fn test_birth() {
        assert_eq!(normalize_birth("1980-01-15"), "19800115");
        assert_eq!(normalize_birth("1980-01-15 00:00:00"), "19800115");
        assert_eq!(normalize_birth("8001"), "8001");
        assert_eq!(normalize_birth(""), "");
    }

    #[test]
    fn test_policy_no() {
        assert_eq!(normalize_policy_no("AB-123"), "AB123");
        assert_eq!(normalize_policy_no(" ab123 "), "AB123");
        assert_eq!(normalize_policy_no("--"), "");
    }

    #[test]
    fn test_date_structured_and_fallbacks() {
        assert_eq!(normalize_date("2024-03-01"), "2024-03-01");
        assert_eq!(normalize_date("2024.3.1"), "2024-03-01");
        assert_eq!(normalize_date("2024/03/01 13:45:00"), "2024-03-01");
        assert_eq!(normalize_date("20240301"), "2024-03-01");
        assert_eq!(normalize_date("45352"), "2024-03-01");
        // Not a valid calendar date, still an 8-digit run
        assert_eq!(normalize_date("2024-13-45"), "2024-13-45");
        assert_eq!(normalize_date("계약일 미정"), "계약일미정");
        assert_eq!(normalize_date("NaN"), "");
        assert_eq!(normalize_date("   "), "");
    }

    #[test]
    fn test_premium() {
        assert_eq!(normalize_premium("35,000"), 35000);
        assert_eq!(normalize_premium("35,000.00"), 35000);
        assert_eq!(normalize_premium("월 12만"), 12);
        assert_eq!(normalize_premium(""), 0);
        assert_eq!(normalize_premium("99999999999999999999999"), 0);
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank(&Some("  a ".into())), Some("a"));
        assert_eq!(non_blank(&Some("   ".into())), None);
        assert_eq!(non_blank(&Some("nan".into())), None);
        assert_eq!(non_blank(&None), None);
        assert_eq!(field(&None), "");
    }
}
