use std::fmt;

use tally_core::{EngineInfo, UsageSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(e.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// The sub-computations of a usage snapshot, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotStep {
    AllUsers,
    DailyUsers,
    MonthlyUsers,
    R30,
    R30V2,
    NonBridgedUsers,
    RegisteredByType,
    EngineVersion,
}

impl SnapshotStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllUsers => "all_users",
            Self::DailyUsers => "daily_users",
            Self::MonthlyUsers => "monthly_users",
            Self::R30 => "r30",
            Self::R30V2 => "r30v2",
            Self::NonBridgedUsers => "non_bridged_users",
            Self::RegisteredByType => "registered_by_type",
            Self::EngineVersion => "engine_version",
        }
    }
}

impl fmt::Display for SnapshotStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    /// A step failed. Fields filled by earlier steps are still valid; the
    /// rest keep their defaults.
    #[error("snapshot failed at {step}: {source}")]
    Partial {
        step: SnapshotStep,
        snapshot: Box<UsageSnapshot>,
        engine: EngineInfo,
        #[source]
        source: StoreError,
    },

    /// The read view could not be opened, so no step ran.
    #[error("snapshot not started: {0}")]
    Store(#[from] StoreError),
}

impl StatsError {
    pub fn partial_snapshot(&self) -> Option<&UsageSnapshot> {
        match self {
            Self::Partial { snapshot, .. } => Some(snapshot),
            Self::Store(_) => None,
        }
    }

    pub fn failed_step(&self) -> Option<SnapshotStep> {
        match self {
            Self::Partial { step, .. } => Some(*step),
            Self::Store(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_display_names_step() {
        let err = StatsError::Partial {
            step: SnapshotStep::R30V2,
            snapshot: Box::default(),
            engine: EngineInfo::unversioned("SQLite"),
            source: StoreError::Database("no such table".into()),
        };
        assert_eq!(
            err.to_string(),
            "snapshot failed at r30v2: database error: no such table"
        );
        assert_eq!(err.failed_step(), Some(SnapshotStep::R30V2));
        assert!(err.partial_snapshot().is_some());
    }

    #[test]
    fn store_variant_has_no_partial() {
        let err: StatsError = StoreError::Io("disk gone".into()).into();
        assert!(err.partial_snapshot().is_none());
        assert!(err.failed_step().is_none());
    }
}
