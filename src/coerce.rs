// 🔁 Type Coercion - best-effort numeric and timestamp normalization
// Every coercion fails soft: unparsable input becomes NULL, never an error.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Canonical timestamp layout understood by SQLite's date functions
pub const CANONICAL_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// COERCION KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coercion {
    /// Value is copied as stored
    Text,
    /// Value is parsed as a float (NULL when not numeric)
    Numeric,
    /// Value is parsed against the known timestamp formats (NULL when none match)
    Timestamp,
}

// ============================================================================
// NUMERIC
// ============================================================================

/// Parse an amount string such as `"123.45"` or `" -7 "`.
///
/// Returns `None` for empty, non-numeric or non-finite input.
pub fn to_numeric(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

// ============================================================================
// TIMESTAMP
// ============================================================================

/// Clock a zoned input is read on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clock {
    /// Local time of the input; the offset is discarded
    Wall,
    /// The instant, converted to UTC
    Utc,
}

/// One parser attempt in the ordered fallback list
#[derive(Debug, Clone, Copy)]
enum Attempt {
    Rfc3339,
    Zoned(&'static str),
    Naive(&'static str),
    DateOnly(&'static str),
}

/// Tried in order; the first match wins.
const ATTEMPTS: &[Attempt] = &[
    Attempt::Rfc3339,
    Attempt::Zoned("%Y-%m-%dT%H:%M:%S%.f%z"),
    Attempt::Zoned("%Y-%m-%dT%H:%M:%S%z"),
    Attempt::Naive("%Y-%m-%dT%H:%M:%S%.f"),
    Attempt::Naive("%Y-%m-%dT%H:%M:%S"),
    Attempt::Naive("%Y-%m-%d %H:%M:%S%.f"),
    Attempt::Naive("%Y-%m-%d %H:%M:%S"),
    Attempt::DateOnly("%Y-%m-%d"),
];

impl Attempt {
    fn parse(&self, text: &str, clock: Clock) -> Option<NaiveDateTime> {
        let zoned = |dt: DateTime<FixedOffset>| match clock {
            Clock::Wall => dt.naive_local(),
            Clock::Utc => dt.naive_utc(),
        };

        match self {
            Attempt::Rfc3339 => DateTime::parse_from_rfc3339(text).ok().map(zoned),
            Attempt::Zoned(fmt) => DateTime::parse_from_str(text, fmt).ok().map(zoned),
            Attempt::Naive(fmt) => NaiveDateTime::parse_from_str(text, fmt).ok(),
            Attempt::DateOnly(fmt) => NaiveDate::parse_from_str(text, fmt)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
        }
    }
}

/// Rewrite the dash-delimited `YYYY-MM-DD-HH:MM:SS:fff` variant into
/// `YYYY-MM-DD HH:MM:SS.fff`. Any other input is returned unchanged.
fn rewrite_dash_delimited(text: &str) -> String {
    // ISO strings with a negative offset also carry 3 dashes and 3 colons
    if text.contains('T') || text.matches(':').count() != 3 || text.matches('-').count() != 3 {
        return text.to_string();
    }

    let parts: Vec<&str> = text.split('-').collect();
    let (date_part, time_part) = (parts[..3].join("-"), parts[3]);

    match time_part.rsplit_once(':') {
        Some((clock, fraction)) => format!("{} {}.{}", date_part, clock, fraction),
        None => text.to_string(),
    }
}

/// Parse a timestamp in any of the known source formats.
///
/// Zoned inputs keep their wall-clock time; the offset is discarded.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    parse_on(text, Clock::Wall)
}

/// Parse a timestamp as an instant for ordering: zoned inputs are converted
/// to UTC, naive inputs are taken as they are.
pub fn parse_instant(text: &str) -> Option<NaiveDateTime> {
    parse_on(text, Clock::Utc)
}

fn parse_on(text: &str, clock: Clock) -> Option<NaiveDateTime> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut candidate = rewrite_dash_delimited(trimmed);
    if let Some(stripped) = candidate.strip_suffix('Z') {
        candidate = format!("{}+0000", stripped);
    }

    ATTEMPTS.iter().find_map(|attempt| attempt.parse(&candidate, clock))
}

/// Normalize a timestamp string to `YYYY-MM-DD HH:MM:SS`.
///
/// `to_timestamp("2024-01-05T10:00:00Z")` → `Some("2024-01-05 10:00:00")`,
/// `to_timestamp("not-a-date")` → `None` (with a warning).
pub fn to_timestamp(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }

    match parse_timestamp(text) {
        Some(dt) => Some(dt.format(CANONICAL_TIMESTAMP).to_string()),
        None => {
            warn!(value = %text, "could not parse timestamp, storing NULL");
            None
        }
    }
}

// ============================================================================
// SQL VALUE COERCION
// ============================================================================

/// Apply a coercion to a value read from a per-source store.
pub fn coerce_value(value: SqlValue, coercion: Coercion) -> SqlValue {
    match (coercion, value) {
        (Coercion::Text, v) => v,
        (_, SqlValue::Null) => SqlValue::Null,

        (Coercion::Numeric, SqlValue::Integer(i)) => SqlValue::Real(i as f64),
        (Coercion::Numeric, SqlValue::Real(r)) => SqlValue::Real(r),
        (Coercion::Numeric, SqlValue::Text(t)) => match to_numeric(&t) {
            Some(n) => SqlValue::Real(n),
            None => {
                if !t.trim().is_empty() {
                    warn!(value = %t, "non-numeric amount, storing NULL");
                }
                SqlValue::Null
            }
        },

        (Coercion::Timestamp, SqlValue::Text(t)) => {
            to_timestamp(&t).map(SqlValue::Text).unwrap_or(SqlValue::Null)
        }

        (coercion, other) => {
            warn!(?coercion, value = ?other, "unsupported value for coercion, storing NULL");
            SqlValue::Null
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
