//! 30-day retention cohorts.
//!
//! R30 and R30V2 are separate, independently versioned metrics: they differ in
//! window bounds, grouping key and platform heuristic. Do not unify them;
//! either change would silently rewrite the history of a published metric.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, Rows};
use tally_core::{classify, time, AccountKind, ClassifierVariant, PlatformTag, UsageSnapshot, ALL_BUCKET};
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Length of the retention period, in days.
pub const RETENTION_DAYS: i64 = 30;
/// R30V2 lookback, in days.
pub const R30V2_LOOKBACK_DAYS: i64 = 60;

const TABLE: &str = "user_daily_visits";

pub struct RetentionAnalyzer {
    db: Database,
}

impl RetentionAnalyzer {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Users whose account is older than 30 days, who visited within the
    /// last 30 days, and whose latest visit is more than 30 days after
    /// account creation. Grouped by the legacy platform of that latest visit.
    ///
    /// Only `all` and observed known platforms appear as keys; `unknown`
    /// users count towards `all` alone.
    #[instrument(skip(self))]
    pub fn compute_r30(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, i64>, StoreError> {
        self.db.with_conn(|conn| r30(conn, now))
    }

    /// Users seen on the same V2 platform at least twice within the last 60
    /// days, with first and last sighting more than 30 days apart. Counted
    /// once per platform.
    ///
    /// Always carries `ios`, `android`, `web`, `electron` and `all`.
    #[instrument(skip(self))]
    pub fn compute_r30_v2(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, i64>, StoreError> {
        self.db.with_conn(|conn| r30_v2(conn, now))
    }
}

pub(crate) fn r30(conn: &Connection, now: DateTime<Utc>) -> Result<BTreeMap<String, i64>, StoreError> {
    let cutoff = time::to_millis(now - time::days(RETENTION_DAYS));
    let min_gap = time::days(RETENTION_DAYS).num_milliseconds();

    let mut stmt = conn.prepare(
        "SELECT platform, COUNT(*) FROM (
             SELECT platform_legacy(MAX(v.user_agent)) AS platform
             FROM account_accounts a
             INNER JOIN (
                 SELECT user_id, MAX(timestamp) AS last_ts
                 FROM user_daily_visits
                 WHERE timestamp > ?1
                 GROUP BY user_id
             ) latest ON latest.user_id = a.user_id
             INNER JOIN user_daily_visits v
                 ON v.user_id = latest.user_id AND v.timestamp = latest.last_ts
             WHERE a.account_type <> ?3
               AND a.created_ts < ?1
               AND latest.last_ts - a.created_ts > ?2
             GROUP BY a.user_id, latest.last_ts
         )
         GROUP BY platform",
    )?;
    let rows = stmt.query(rusqlite::params![cutoff, min_gap, AccountKind::AppService.code()])?;
    fold_buckets(BTreeMap::new(), rows)
}

pub(crate) fn r30_v2(conn: &Connection, now: DateTime<Utc>) -> Result<BTreeMap<String, i64>, StoreError> {
    let lookback = time::to_millis(now - time::days(R30V2_LOOKBACK_DAYS));
    let tomorrow = time::to_millis(now + time::days(1));
    let min_gap = time::days(RETENTION_DAYS).num_milliseconds();

    let mut stmt = conn.prepare(
        "SELECT platform, COUNT(*) FROM (
             SELECT platform_v2(user_agent) AS platform
             FROM user_daily_visits
             WHERE timestamp > ?1 AND timestamp < ?2
             GROUP BY user_id, platform
             HAVING MAX(timestamp) - MIN(timestamp) > ?3
         )
         GROUP BY platform",
    )?;
    let rows = stmt.query([lookback, tomorrow, min_gap])?;
    fold_buckets(UsageSnapshot::seeded_r30v2(), rows)
}

/// Register `platform_legacy(ua)` and `platform_v2(ua)` on `conn`. Both return
/// the tag name; NULL classifies as `unknown`.
pub(crate) fn register_platform_functions(conn: &Connection) -> rusqlite::Result<()> {
    register_classifier(conn, "platform_legacy", ClassifierVariant::Legacy)?;
    register_classifier(conn, "platform_v2", ClassifierVariant::V2)
}

fn register_classifier(
    conn: &Connection,
    name: &str,
    variant: ClassifierVariant,
) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        name,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let agent: Option<String> = ctx.get(0)?;
            Ok(classify(agent.as_deref().unwrap_or_default(), variant).as_str())
        },
    )
}

/// Add `(platform, count)` rows into `seed`: every row adds to `all`, only
/// known platforms get their own key.
fn fold_buckets(
    mut seed: BTreeMap<String, i64>,
    mut rows: Rows<'_>,
) -> Result<BTreeMap<String, i64>, StoreError> {
    while let Some(row) = rows.next()? {
        let name: String = row_helpers::get(row, 0, TABLE, "user_agent")?;
        let count: i64 = row_helpers::get(row, 1, TABLE, "user_agent")?;
        let tag = PlatformTag::from_str(&name).map_err(|detail| StoreError::CorruptRow {
            table: TABLE,
            column: "user_agent",
            detail,
        })?;

        *seed.entry(ALL_BUCKET.to_string()).or_insert(0) += count;
        if tag.is_known() {
            *seed.entry(tag.as_str().to_string()).or_insert(0) += count;
        }
    }
    Ok(seed)
}
