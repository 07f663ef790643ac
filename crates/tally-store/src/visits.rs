//! Daily-visit ledger.
//!
//! Device rows only carry a "last seen" time that is overwritten on every
//! request. The ledger snapshots that activity into one row per user, device
//! and day so retention can be measured over history the device table no
//! longer has.

use chrono::{DateTime, Utc};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use tally_core::{time, AccountKind};
use tracing::{info, instrument};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One deduplicated visit fact. `day` is always midnight UTC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyVisit {
    pub user_id: String,
    pub device_id: String,
    pub day: DateTime<Utc>,
    pub client_identifier: Option<String>,
}

/// Point up to which device activity has been materialized.
/// Only advanced after a successful run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watermark {
    pub last_materialized_at: DateTime<Utc>,
}

/// Bounds of one materialization run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaterializeWindow {
    /// Inclusive lower bound on `last_seen`.
    pub start: DateTime<Utc>,
    /// Exclusive upper bound on `last_seen`.
    pub end: DateTime<Utc>,
    /// Day the resulting facts are dated to.
    pub as_of: DateTime<Utc>,
}

impl Watermark {
    pub fn new(last_materialized_at: DateTime<Utc>) -> Self {
        Self {
            last_materialized_at,
        }
    }

    /// Window for a run at `now`: everything since the watermark.
    ///
    /// The first run after a day boundary dates its facts to the previous day,
    /// since the activity it picks up happened before midnight.
    pub fn select_window(&self, now: DateTime<Utc>) -> MaterializeWindow {
        let today_start = time::truncate_to_day(now);
        let as_of = if today_start > self.last_materialized_at {
            today_start - time::days(1)
        } else {
            today_start
        };
        MaterializeWindow {
            start: self.last_materialized_at,
            end: now,
            as_of,
        }
    }
}

/// Owns the watermark. Whoever holds the ledger by `&mut` is the single
/// writer of materialization state.
pub struct VisitLedger {
    db: Database,
    watermark: Watermark,
}

impl VisitLedger {
    /// Ledger whose watermark starts at the current time.
    pub fn new(db: Database) -> Self {
        Self::with_watermark(db, Watermark::new(Utc::now()))
    }

    pub fn with_watermark(db: Database, watermark: Watermark) -> Self {
        Self { db, watermark }
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Record a visit for every user/admin device with `last_seen` in
    /// `[window_start, window_end)`, dated to the day of `as_of`.
    ///
    /// Existing facts for the same user, device and day are left untouched, so
    /// overlapping windows are safe. Returns the number of new facts.
    #[instrument(skip(self))]
    pub fn materialize(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        as_of: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let day = time::to_millis(time::truncate_to_day(as_of));
        let kinds = AccountKind::VISIT_TRACKED;
        let sql = format!(
            "INSERT OR IGNORE INTO user_daily_visits (user_id, device_id, timestamp, user_agent)
             SELECT d.user_id, d.device_id, ?1, MAX(d.user_agent)
             FROM device_devices d
             INNER JOIN account_accounts a ON a.user_id = d.user_id
             WHERE ?2 <= d.last_seen_ts AND d.last_seen_ts < ?3
               AND a.account_type IN ({})
             GROUP BY d.user_id, d.device_id",
            row_helpers::placeholders(4, kinds.len())
        );

        let mut params = vec![
            Value::Integer(day),
            Value::Integer(time::to_millis(window_start)),
            Value::Integer(time::to_millis(window_end)),
        ];
        params.extend(kinds.iter().map(|k| Value::Integer(k.code())));

        let written = self
            .db
            .with_conn(|conn| Ok(conn.execute(&sql, params_from_iter(params))?))?;
        Ok(written as u64)
    }

    /// One scheduled run at `now`: materialize the window since the
    /// watermark, then advance the watermark to `now`. A failed run leaves the
    /// watermark alone so the next run covers the same span again.
    pub fn run_at(&mut self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let window = self.watermark.select_window(now);
        let written = self.materialize(window.start, window.end, window.as_of)?;
        self.watermark.last_materialized_at = now;
        info!(
            window_start = %window.start,
            window_end = %window.end,
            as_of = %window.as_of,
            written,
            "daily visits materialized"
        );
        Ok(written)
    }

    pub fn run(&mut self) -> Result<u64, StoreError> {
        self.run_at(Utc::now())
    }

    /// All facts for a user, oldest first.
    #[instrument(skip(self))]
    pub fn visits_for_user(&self, user_id: &str) -> Result<Vec<DailyVisit>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, device_id, timestamp, user_agent FROM user_daily_visits
                 WHERE user_id = ?1 ORDER BY timestamp, device_id",
            )?;
            let mut rows = stmt.query([user_id])?;
            let mut visits = Vec::new();
            while let Some(row) = rows.next()? {
                visits.push(DailyVisit {
                    user_id: row_helpers::get(row, 0, TABLE, "user_id")?,
                    device_id: row_helpers::get(row, 1, TABLE, "device_id")?,
                    day: row_helpers::get_timestamp(row, 2, TABLE, "timestamp")?,
                    client_identifier: row_helpers::get(row, 3, TABLE, "user_agent")?,
                });
            }
            Ok(visits)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM user_daily_visits", [], |row| row.get(0))?)
        })
    }
}

const TABLE: &str = "user_daily_visits";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountRecord, AccountRepo};
    use crate::devices::{DeviceRecord, DeviceRepo};
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, h, m, 0).unwrap()
    }

    struct Fixture {
        db: Database,
        accounts: AccountRepo,
        devices: DeviceRepo,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Database::in_memory().unwrap();
            Self {
                accounts: AccountRepo::new(db.clone()),
                devices: DeviceRepo::new(db.clone()),
                db,
            }
        }

        fn account(&self, user_id: &str, kind: AccountKind) {
            self.accounts
                .insert(&AccountRecord {
                    user_id: user_id.into(),
                    created_at: at(0, 0) - Duration::days(100),
                    kind,
                    appservice_id: None,
                })
                .unwrap();
        }

        fn seen(&self, user_id: &str, device_id: &str, ts: DateTime<Utc>, ua: &str) {
            self.devices
                .upsert(&DeviceRecord {
                    user_id: user_id.into(),
                    device_id: device_id.into(),
                    last_seen_at: ts,
                    client_identifier: ua.into(),
                })
                .unwrap();
        }

        fn ledger(&self, watermark: DateTime<Utc>) -> VisitLedger {
            VisitLedger::with_watermark(self.db.clone(), Watermark::new(watermark))
        }
    }

    #[test]
    fn window_same_day_uses_today() {
        let wm = Watermark::new(at(9, 0));
        let w = wm.select_window(at(12, 0));
        assert_eq!(w.start, at(9, 0));
        assert_eq!(w.end, at(12, 0));
        assert_eq!(w.as_of, at(0, 0));
    }

    #[test]
    fn window_after_midnight_uses_previous_day() {
        let wm = Watermark::new(at(21, 0) - Duration::days(1));
        let w = wm.select_window(at(0, 5));
        assert_eq!(w.as_of, at(0, 0) - Duration::days(1));
        assert_eq!(w.start, wm.last_materialized_at);
    }

    #[test]
    fn window_watermark_exactly_at_midnight_uses_today() {
        let wm = Watermark::new(at(0, 0));
        assert_eq!(wm.select_window(at(3, 0)).as_of, at(0, 0));
    }

    #[test]
    fn materialize_only_user_and_admin_in_window() {
        let fx = Fixture::new();
        fx.account("user", AccountKind::User);
        fx.account("admin", AccountKind::Admin);
        fx.account("guest", AccountKind::Guest);
        fx.account("bot", AccountKind::AppService);
        fx.seen("user", "A", at(10, 0), "Element (iOS)");
        fx.seen("admin", "B", at(10, 30), "Mozilla/5.0");
        fx.seen("guest", "C", at(10, 30), "Mozilla/5.0");
        fx.seen("bot", "D", at(10, 30), "bridge");
        fx.seen("user", "E", at(8, 0), "too early");
        fx.seen("admin", "F", at(11, 0), "exactly at end");

        let ledger = fx.ledger(at(9, 0));
        let written = ledger.materialize(at(9, 0), at(11, 0), at(11, 0)).unwrap();
        assert_eq!(written, 2);

        let visits = ledger.visits_for_user("user").unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].device_id, "A");
        assert_eq!(visits[0].day, at(0, 0));
        assert_eq!(visits[0].client_identifier.as_deref(), Some("Element (iOS)"));
        assert!(ledger.visits_for_user("guest").unwrap().is_empty());
        assert!(ledger.visits_for_user("bot").unwrap().is_empty());
    }

    #[test]
    fn materialize_window_start_is_inclusive() {
        let fx = Fixture::new();
        fx.account("user", AccountKind::User);
        fx.seen("user", "A", at(9, 0), "ua");
        let ledger = fx.ledger(at(9, 0));
        assert_eq!(ledger.materialize(at(9, 0), at(10, 0), at(10, 0)).unwrap(), 1);
    }

    #[test]
    fn materialize_twice_is_idempotent() {
        let fx = Fixture::new();
        fx.account("user", AccountKind::User);
        fx.seen("user", "A", at(10, 0), "first");

        let ledger = fx.ledger(at(9, 0));
        assert_eq!(ledger.materialize(at(9, 0), at(11, 0), at(11, 0)).unwrap(), 1);

        // Same day, overlapping window, newer identifier: first write wins
        fx.seen("user", "A", at(12, 0), "second");
        assert_eq!(ledger.materialize(at(9, 0), at(13, 0), at(13, 0)).unwrap(), 0);

        let visits = ledger.visits_for_user("user").unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].client_identifier.as_deref(), Some("first"));
    }

    #[test]
    fn run_twice_without_new_activity_writes_nothing() {
        let fx = Fixture::new();
        fx.account("user", AccountKind::User);
        fx.seen("user", "A", at(10, 0), "ua");

        let mut ledger = fx.ledger(at(9, 0));
        assert_eq!(ledger.run_at(at(11, 0)).unwrap(), 1);
        assert_eq!(ledger.run_at(at(11, 5)).unwrap(), 0);
        assert_eq!(ledger.count().unwrap(), 1);
        assert_eq!(ledger.watermark().last_materialized_at, at(11, 5));
    }

    #[test]
    fn run_just_after_midnight_dates_to_previous_day() {
        let fx = Fixture::new();
        fx.account("user", AccountKind::User);
        fx.seen("user", "A", at(23, 50) - Duration::days(1), "ua");

        let mut ledger = fx.ledger(at(21, 0) - Duration::days(1));
        assert_eq!(ledger.run_at(at(0, 10)).unwrap(), 1);

        let visits = ledger.visits_for_user("user").unwrap();
        assert_eq!(visits[0].day, at(0, 0) - Duration::days(1));
    }

    #[test]
    fn failed_run_keeps_watermark() {
        let fx = Fixture::new();
        fx.account("user", AccountKind::User);
        let mut ledger = fx.ledger(at(9, 0));

        fx.db
            .with_conn(|conn| Ok(conn.execute_batch("DROP TABLE user_daily_visits")?))
            .unwrap();

        assert!(ledger.run_at(at(12, 0)).is_err());
        assert_eq!(ledger.watermark().last_materialized_at, at(9, 0));
    }

    #[test]
    fn retry_after_failure_covers_widened_window() {
        let fx = Fixture::new();
        fx.account("user", AccountKind::User);
        fx.seen("user", "A", at(10, 0), "ua");
        let mut ledger = fx.ledger(at(9, 0));

        fx.db
            .with_conn(|conn| Ok(conn.execute_batch("ALTER TABLE user_daily_visits RENAME TO parked")?))
            .unwrap();
        assert!(ledger.run_at(at(11, 0)).is_err());

        fx.db
            .with_conn(|conn| Ok(conn.execute_batch("ALTER TABLE parked RENAME TO user_daily_visits")?))
            .unwrap();
        fx.seen("user", "B", at(12, 0), "ua");
        assert_eq!(ledger.run_at(at(13, 0)).unwrap(), 2);
    }
}
