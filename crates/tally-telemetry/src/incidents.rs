//! Persistent record of WARN and ERROR events, keyed by background job.
//!
//! Background runs have no caller to report to, so their failures would
//! otherwise only exist in the process's stdout. [`IncidentLayer`] copies
//! every WARN+ event into [`IncidentLog`] together with the job it happened
//! in, taken from the event's own `job` field or from the nearest enclosing
//! span that has one. `tally logs` reads them back.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
CREATE TABLE IF NOT EXISTS job_incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at INTEGER NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    job TEXT,
    message TEXT NOT NULL,
    error TEXT,
    fields TEXT
);
CREATE INDEX IF NOT EXISTS idx_incidents_job_time ON job_incidents(job, recorded_at);
";

/// One persisted WARN or ERROR event.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: i64,
    pub recorded_at: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub job: Option<String>,
    pub message: String,
    /// The event's `error` field, if it had one.
    pub error: Option<String>,
    /// Remaining event fields.
    pub fields: Option<Value>,
}

/// Which incidents [`IncidentLog::recent`] returns, newest first.
#[derive(Clone, Debug)]
pub struct IncidentFilter {
    pub job: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub errors_only: bool,
    pub limit: u32,
}

impl Default for IncidentFilter {
    fn default() -> Self {
        Self {
            job: None,
            since: None,
            errors_only: false,
            limit: 50,
        }
    }
}

struct NewIncident<'a> {
    recorded_at: DateTime<Utc>,
    level: &'static str,
    target: &'a str,
    job: Option<&'a str>,
    message: &'a str,
    error: Option<&'a str>,
    fields: Option<String>,
}

pub struct IncidentLog {
    conn: Mutex<Connection>,
}

impl IncidentLog {
    /// Open or create the incident database. The parent directory must exist.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Write failures are dropped: there is nowhere left to report them.
    fn append(&self, incident: &NewIncident<'_>) {
        let _ = self.conn.lock().execute(
            "INSERT INTO job_incidents (recorded_at, level, target, job, message, error, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                incident.recorded_at.timestamp_millis(),
                incident.level,
                incident.target,
                incident.job,
                incident.message,
                incident.error,
                incident.fields,
            ],
        );
    }

    pub fn recent(&self, filter: &IncidentFilter) -> rusqlite::Result<Vec<Incident>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, recorded_at, level, target, job, message, error, fields
             FROM job_incidents
             WHERE (?1 IS NULL OR job = ?1)
               AND (?2 IS NULL OR recorded_at >= ?2)
               AND (?3 = 0 OR level = 'ERROR')
             ORDER BY id DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![
                filter.job,
                filter.since.map(|t| t.timestamp_millis()),
                filter.errors_only,
                filter.limit,
            ],
            |row| {
                let ms: i64 = row.get(1)?;
                let fields: Option<String> = row.get(7)?;
                Ok(Incident {
                    id: row.get(0)?,
                    recorded_at: DateTime::from_timestamp_millis(ms)
                        .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, ms))?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    job: row.get(4)?,
                    message: row.get(5)?,
                    error: row.get(6)?,
                    fields: fields.and_then(|f| serde_json::from_str(&f).ok()),
                })
            },
        )?;
        rows.collect()
    }
}

/// Layer feeding WARN+ events into an [`IncidentLog`].
pub struct IncidentLayer {
    log: Arc<IncidentLog>,
}

impl IncidentLayer {
    pub fn new(log: Arc<IncidentLog>) -> Self {
        Self { log }
    }
}

/// Job name attached to a span.
struct SpanJob(String);

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    job: Option<String>,
    error: Option<String>,
    rest: Map<String, Value>,
}

impl EventFields {
    fn put(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "job" => self.job = Some(value),
            "error" => self.error = Some(value),
            name => {
                self.rest.insert(name.to_string(), Value::String(value));
            }
        }
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

impl<S> Layer<S> for IncidentLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        attrs.record(&mut fields);
        if let (Some(job), Some(span)) = (fields.job, ctx.span(id)) {
            span.extensions_mut().insert(SpanJob(job));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        if fields.job.is_none() {
            for span in ctx.event_scope(event).into_iter().flatten() {
                if let Some(job) = span.extensions().get::<SpanJob>() {
                    fields.job = Some(job.0.clone());
                    break;
                }
            }
        }

        let rest = if fields.rest.is_empty() {
            None
        } else {
            serde_json::to_string(&fields.rest).ok()
        };

        self.log.append(&NewIncident {
            recorded_at: Utc::now(),
            level: meta.level().as_str(),
            target: meta.target(),
            job: fields.job.as_deref(),
            message: fields.message.as_deref().unwrap_or_default(),
            error: fields.error.as_deref(),
            fields: rest,
        });
    }
}
