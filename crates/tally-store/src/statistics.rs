use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tally_core::{time, AccountKind, EngineInfo, UsageSnapshot};
use tracing::{debug, instrument, warn};

use crate::database::{self, Database};
use crate::error::{SnapshotStep, StatsError, StoreError};
use crate::{accounts, devices, retention, schema};

const DAILY_WINDOW_DAYS: i64 = 1;
const MONTHLY_WINDOW_DAYS: i64 = 30;
const REGISTRATION_WINDOW_DAYS: i64 = 1;

/// Builds [`UsageSnapshot`]s from the account, device and visit tables.
///
/// Read-only; safe to call from many callers at once.
#[derive(Clone)]
pub struct StatisticsAggregator {
    db: Database,
}

impl StatisticsAggregator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Compute every metric, one store access per step.
    ///
    /// Steps are not isolated from each other: a write landing between two
    /// steps can make them disagree slightly. On failure the error carries the
    /// metrics computed so far.
    #[instrument(skip(self))]
    pub fn snapshot(&self, now: DateTime<Utc>) -> Result<(UsageSnapshot, EngineInfo), StatsError> {
        collect(&Access::PerStep(&self.db), now)
    }

    /// Like [`snapshot`](Self::snapshot), but every step reads from a single
    /// transaction, so all metrics describe the same state.
    #[instrument(skip(self))]
    pub fn snapshot_consistent(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(UsageSnapshot, EngineInfo), StatsError> {
        self.db.with_conn(|conn| {
            // Read-only: dropping the transaction rolls it back.
            let tx = conn.unchecked_transaction()?;
            Ok(collect(&Access::Shared(&tx), now))
        })?
    }
}

/// How each step reaches the connection.
enum Access<'a> {
    /// Lock the shared connection anew for every step.
    PerStep(&'a Database),
    /// Reuse one connection (inside a transaction).
    Shared(&'a Connection),
}

impl Access<'_> {
    fn run<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        match self {
            Self::PerStep(db) => db.with_conn(f),
            Self::Shared(conn) => f(conn),
        }
    }
}

fn partial(
    step: SnapshotStep,
    snapshot: &UsageSnapshot,
    engine: &EngineInfo,
    source: StoreError,
) -> StatsError {
    warn!(step = %step, error = %source, "usage snapshot incomplete");
    StatsError::Partial {
        step,
        snapshot: Box::new(snapshot.clone()),
        engine: engine.clone(),
        source,
    }
}

fn collect(access: &Access<'_>, now: DateTime<Utc>) -> Result<(UsageSnapshot, EngineInfo), StatsError> {
    let mut snapshot = UsageSnapshot::default();
    let mut engine = EngineInfo::unversioned(schema::ENGINE_NAME);

    snapshot.all_users = access
        .run(|conn| accounts::count_by_kinds(conn, &AccountKind::ALL))
        .map_err(|e| partial(SnapshotStep::AllUsers, &snapshot, &engine, e))?;

    snapshot.daily_users = access
        .run(|conn| devices::count_users_seen_after(conn, now - time::days(DAILY_WINDOW_DAYS)))
        .map_err(|e| partial(SnapshotStep::DailyUsers, &snapshot, &engine, e))?;

    snapshot.monthly_users = access
        .run(|conn| devices::count_users_seen_after(conn, now - time::days(MONTHLY_WINDOW_DAYS)))
        .map_err(|e| partial(SnapshotStep::MonthlyUsers, &snapshot, &engine, e))?;

    snapshot.r30 = access
        .run(|conn| retention::r30(conn, now))
        .map_err(|e| partial(SnapshotStep::R30, &snapshot, &engine, e))?;

    snapshot.r30v2 = access
        .run(|conn| retention::r30_v2(conn, now))
        .map_err(|e| partial(SnapshotStep::R30V2, &snapshot, &engine, e))?;

    snapshot.non_bridged_users = access
        .run(|conn| accounts::count_by_kinds(conn, &AccountKind::NON_BRIDGED))
        .map_err(|e| partial(SnapshotStep::NonBridgedUsers, &snapshot, &engine, e))?;

    snapshot.registered_by_kind = access
        .run(|conn| {
            accounts::registered_by_type(conn, now - time::days(REGISTRATION_WINDOW_DAYS))
        })
        .map_err(|e| partial(SnapshotStep::RegisteredByType, &snapshot, &engine, e))?;

    engine = access
        .run(database::engine_info)
        .map_err(|e| partial(SnapshotStep::EngineVersion, &snapshot, &engine, e))?;

    debug!(
        all_users = snapshot.all_users,
        daily_users = snapshot.daily_users,
        monthly_users = snapshot.monthly_users,
        "usage snapshot computed"
    );
    Ok((snapshot, engine))
}
