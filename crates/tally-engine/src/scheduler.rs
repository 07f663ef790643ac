//! Single-flight periodic job loop.
//!
//! One tokio task per job: sleep the initial delay, then run, log, sleep the
//! interval, forever. The interval starts when the previous run ends, so two
//! runs of the same job never overlap. Failed and panicking runs are logged
//! and counted; neither stops the loop.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tally_settings::MaterializerSettings;
use tally_store::{StoreError, VisitLedger};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

/// When a job first runs and how long to wait between runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5 * 60),
            interval: Duration::from_secs(3 * 60 * 60),
        }
    }
}

impl From<&MaterializerSettings> for Schedule {
    fn from(settings: &MaterializerSettings) -> Self {
        Self {
            initial_delay: settings.initial_delay(),
            interval: settings.interval(),
        }
    }
}

/// Blocking unit of background work.
///
/// `run` is called on a blocking thread and gets `&mut self`, so a job can
/// keep state (such as a watermark) between runs.
pub trait PeriodicJob: Send + 'static {
    fn name(&self) -> &'static str;

    /// Returns the number of items the run wrote.
    fn run(&mut self) -> Result<u64, StoreError>;
}

impl PeriodicJob for VisitLedger {
    fn name(&self) -> &'static str {
        "daily_visits"
    }

    fn run(&mut self) -> Result<u64, StoreError> {
        VisitLedger::run(self)
    }
}

#[derive(Default)]
struct RunCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Handle to a spawned job loop.
pub struct SchedulerHandle {
    name: &'static str,
    counters: Arc<RunCounters>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs that returned `Ok`.
    pub fn completed_runs(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    /// Runs that returned `Err` or panicked. Neither stops the loop.
    pub fn failed_runs(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop. A run already executing on the blocking pool finishes
    /// on its own but its result is discarded.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
        info!(job = self.name, "scheduler stopped");
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Start `job` on its own task. Must be called inside a tokio runtime.
    pub fn spawn<J: PeriodicJob>(job: J, schedule: Schedule) -> SchedulerHandle {
        let name = job.name();
        let counters = Arc::new(RunCounters::default());
        let span = info_span!("periodic", job = name);
        let task = tokio::spawn(run_loop(job, schedule, Arc::clone(&counters)).instrument(span));
        info!(
            job = name,
            initial_delay_secs = schedule.initial_delay.as_secs(),
            interval_secs = schedule.interval.as_secs(),
            "scheduler started"
        );
        SchedulerHandle {
            name,
            counters,
            task,
        }
    }
}

async fn run_loop<J: PeriodicJob>(mut job: J, schedule: Schedule, counters: Arc<RunCounters>) {
    tokio::time::sleep(schedule.initial_delay).await;
    loop {
        // Move the job onto the blocking pool and take it back afterwards,
        // even when the run panics.
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run()));
            (job, outcome)
        })
        .await;

        let (returned, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "periodic task lost its job, stopping");
                return;
            }
        };
        job = returned;

        match outcome {
            Ok(Ok(written)) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(written, "periodic run complete");
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "periodic run failed");
            }
            Err(payload) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = panic_message(&*payload), "periodic run panicked");
            }
        }

        tokio::time::sleep(schedule.interval).await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::sleep;

    const DELAY: Duration = Duration::from_secs(300);
    const INTERVAL: Duration = Duration::from_secs(3600);

    fn schedule() -> Schedule {
        Schedule {
            initial_delay: DELAY,
            interval: INTERVAL,
        }
    }

    /// Counts runs; fails on the (1-based) runs listed in `fail_on`.
    struct Probe {
        starts: Arc<Mutex<Vec<usize>>>,
        fail_on: Vec<usize>,
    }

    impl Probe {
        fn new(fail_on: Vec<usize>) -> (Self, Arc<Mutex<Vec<usize>>>) {
            let starts = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    starts: Arc::clone(&starts),
                    fail_on,
                },
                starts,
            )
        }
    }

    impl PeriodicJob for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn run(&mut self) -> Result<u64, StoreError> {
            let mut starts = self.starts.lock().unwrap();
            let n = starts.len() + 1;
            starts.push(n);
            if self.fail_on.contains(&starts.len()) {
                Err(StoreError::Database("locked".into()))
            } else {
                Ok(1)
            }
        }
    }

    #[test]
    fn default_schedule() {
        let s = Schedule::default();
        assert_eq!(s.initial_delay, Duration::from_secs(300));
        assert_eq!(s.interval, Duration::from_secs(10_800));
    }

    #[test]
    fn schedule_from_settings() {
        let settings = MaterializerSettings {
            enabled: true,
            initial_delay_secs: 0,
            interval_secs: 120,
        };
        let s = Schedule::from(&settings);
        assert_eq!(s.initial_delay, Duration::ZERO);
        assert_eq!(s.interval, Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_initial_delay() {
        let (probe, starts) = Probe::new(vec![]);
        let handle = Scheduler::spawn(probe, schedule());

        sleep(DELAY - Duration::from_secs(1)).await;
        assert_eq!(handle.completed_runs(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.completed_runs(), 1);
        assert_eq!(starts.lock().unwrap().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn runs_every_interval() {
        let (probe, _starts) = Probe::new(vec![]);
        let handle = Scheduler::spawn(probe, schedule());

        sleep(DELAY + INTERVAL - Duration::from_secs(1)).await;
        assert_eq!(handle.completed_runs(), 1);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.completed_runs(), 2);

        sleep(INTERVAL).await;
        assert_eq!(handle.completed_runs(), 3);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failure_does_not_stop_loop() {
        let (probe, _starts) = Probe::new(vec![1, 2]);
        let handle = Scheduler::spawn(probe, schedule());

        sleep(DELAY + INTERVAL * 2 + Duration::from_secs(1)).await;
        assert_eq!(handle.failed_runs(), 2);
        assert_eq!(handle.completed_runs(), 1);
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    /// Panics on its first run, succeeds afterwards.
    struct PanicsOnce {
        runs: usize,
    }

    impl PeriodicJob for PanicsOnce {
        fn name(&self) -> &'static str {
            "panics_once"
        }

        fn run(&mut self) -> Result<u64, StoreError> {
            self.runs += 1;
            if self.runs == 1 {
                panic!("first run blew up");
            }
            Ok(self.runs as u64)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_run_keeps_loop_alive() {
        let handle = Scheduler::spawn(PanicsOnce { runs: 0 }, schedule());

        sleep(DELAY + Duration::from_secs(1)).await;
        assert_eq!(handle.failed_runs(), 1);
        assert_eq!(handle.completed_runs(), 0);
        assert!(!handle.is_finished());

        sleep(INTERVAL * 2).await;
        assert_eq!(handle.failed_runs(), 1);
        assert_eq!(handle.completed_runs(), 2);
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let from_str: Box<dyn Any + Send> = Box::new("static");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*from_str), "static");
        assert_eq!(panic_message(&*from_string), "owned");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_future_runs() {
        let (probe, starts) = Probe::new(vec![]);
        let handle = Scheduler::spawn(probe, schedule());

        sleep(DELAY + Duration::from_secs(1)).await;
        handle.shutdown().await;

        sleep(INTERVAL * 3).await;
        assert_eq!(starts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_job_materializes_recent_activity() {
        use chrono::{Duration as ChronoDuration, Utc};
        use tally_core::AccountKind;
        use tally_store::{AccountRecord, AccountRepo, Database, DeviceRecord, DeviceRepo, Watermark};

        let db = Database::in_memory().unwrap();
        let wall = Utc::now();
        AccountRepo::new(db.clone())
            .insert(&AccountRecord {
                user_id: "@mia:example.org".into(),
                created_at: wall - ChronoDuration::days(3),
                kind: AccountKind::User,
                appservice_id: None,
            })
            .unwrap();
        DeviceRepo::new(db.clone())
            .upsert(&DeviceRecord {
                user_id: "@mia:example.org".into(),
                device_id: "PHONE".into(),
                last_seen_at: wall - ChronoDuration::minutes(30),
                client_identifier: "Element/1.0 (iOS)".into(),
            })
            .unwrap();

        let ledger = VisitLedger::with_watermark(db.clone(), Watermark::new(wall - ChronoDuration::hours(1)));
        assert_eq!(PeriodicJob::name(&ledger), "daily_visits");

        let handle = Scheduler::spawn(
            ledger,
            Schedule {
                initial_delay: Duration::ZERO,
                interval: INTERVAL,
            },
        );
        sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.completed_runs(), 1);
        assert_eq!(handle.failed_runs(), 0);
        handle.shutdown().await;

        // The job owns its ledger; read the facts back through a fresh one.
        let reader = VisitLedger::with_watermark(db, Watermark::new(wall));
        let visits = reader.visits_for_user("@mia:example.org").unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].device_id, "PHONE");
    }
}
