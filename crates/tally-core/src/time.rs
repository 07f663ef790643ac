//! Millisecond timestamps and day truncation.
//!
//! Stored timestamps are integer milliseconds since the Unix epoch. Days are
//! UTC calendar days, i.e. a timestamp truncated to a 24h boundary.

use chrono::{DateTime, Duration, NaiveTime, Utc};

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub fn days(n: i64) -> Duration {
    Duration::days(n)
}

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Midnight UTC of the day containing `ts`.
pub fn truncate_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_time(NaiveTime::MIN).and_utc()
}
