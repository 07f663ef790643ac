use chrono::{DateTime, Utc};
use tally_core::{time, AccountKind};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Read a millisecond timestamp column.
pub fn get_timestamp(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    let ms: i64 = get(row, idx, table, column)?;
    parse_timestamp(ms, table, column)
}

pub fn parse_timestamp(
    ms: i64,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    time::from_millis(ms).ok_or_else(|| StoreError::CorruptRow {
        table,
        column,
        detail: format!("timestamp out of range: {ms}"),
    })
}

/// Decode an integer account type code.
pub fn parse_account_kind(
    code: i64,
    table: &'static str,
    column: &'static str,
) -> Result<AccountKind, StoreError> {
    AccountKind::from_code(code).ok_or_else(|| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown account type: {code}"),
    })
}

/// `?1, ?2, ...` for an IN list of `n` values, starting at `first`.
pub fn placeholders(first: usize, n: usize) -> String {
    (first..first + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}
