//! # tally-engine
//!
//! Background materialization and the snapshot entry point.
//!
//! - [`Scheduler`] drives a [`PeriodicJob`] (the daily-visit ledger) on a
//!   single-flight tokio task.
//! - [`StatsEngine`] owns the database, starts the scheduler from
//!   [`MaterializerSettings`](tally_settings::MaterializerSettings) and answers
//!   snapshot requests.

#![deny(unsafe_code)]

pub mod engine;
pub mod scheduler;

pub use engine::StatsEngine;
pub use scheduler::{PeriodicJob, Schedule, Scheduler, SchedulerHandle};
