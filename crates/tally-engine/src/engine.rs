use chrono::{DateTime, Utc};
use tally_core::{EngineInfo, UsageSnapshot};
use tally_settings::MaterializerSettings;
use tally_store::{Database, StatisticsAggregator, StatsError, VisitLedger};
use tracing::info;

use crate::scheduler::{Schedule, Scheduler, SchedulerHandle};

/// Entry point: owns the database, optionally the background materializer,
/// and answers snapshot requests.
pub struct StatsEngine {
    db: Database,
    aggregator: StatisticsAggregator,
    materializer: Option<SchedulerHandle>,
}

impl StatsEngine {
    /// Snapshot-only engine; nothing runs in the background.
    pub fn new(db: Database) -> Self {
        Self {
            aggregator: StatisticsAggregator::new(db.clone()),
            db,
            materializer: None,
        }
    }

    /// Engine with daily-visit materialization scheduled per `settings`.
    /// The ledger's watermark starts at the current time.
    ///
    /// Must be called inside a tokio runtime when materialization is enabled.
    pub fn start(db: Database, settings: &MaterializerSettings) -> Self {
        let mut engine = Self::new(db);
        if settings.enabled {
            let ledger = VisitLedger::new(engine.db.clone());
            engine.materializer = Some(Scheduler::spawn(ledger, Schedule::from(settings)));
        } else {
            info!("daily visit materialization disabled");
        }
        engine
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn materializer(&self) -> Option<&SchedulerHandle> {
        self.materializer.as_ref()
    }

    /// Point-in-time usage metrics. See [`StatisticsAggregator::snapshot`].
    pub fn get_snapshot(&self, now: DateTime<Utc>) -> Result<(UsageSnapshot, EngineInfo), StatsError> {
        self.aggregator.snapshot(now)
    }

    /// Same metrics read from a single transaction.
    pub fn get_snapshot_consistent(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(UsageSnapshot, EngineInfo), StatsError> {
        self.aggregator.snapshot_consistent(now)
    }

    pub async fn shutdown(self) {
        if let Some(handle) = self.materializer {
            handle.shutdown().await;
        }
    }
}
