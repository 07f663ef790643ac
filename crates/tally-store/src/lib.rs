pub mod accounts;
pub mod database;
pub mod devices;
pub mod error;
pub mod retention;
pub mod row_helpers;
pub mod schema;
pub mod statistics;
pub mod visits;

pub use accounts::{AccountRecord, AccountRepo};
pub use database::Database;
pub use devices::{DeviceRecord, DeviceRepo};
pub use error::{SnapshotStep, StatsError, StoreError};
pub use retention::RetentionAnalyzer;
pub use statistics::StatisticsAggregator;
pub use visits::{DailyVisit, MaterializeWindow, VisitLedger, Watermark};
