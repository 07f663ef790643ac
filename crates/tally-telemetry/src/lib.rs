//! # tally-telemetry
//!
//! JSON logs on stdout, filtered by `RUST_LOG` or the configured level, plus
//! an optional [`IncidentLog`] keeping WARN and ERROR events per background
//! job in SQLite.

mod incidents;

pub use incidents::{Incident, IncidentFilter, IncidentLayer, IncidentLog};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level when `RUST_LOG` is unset.
    pub log_level: Level,
    /// Record WARN+ events in the incident log.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            log_to_sqlite: false,
            log_db_path: PathBuf::from("incidents.db"),
        }
    }
}

fn default_directive(level: Level) -> String {
    level.as_str().to_lowercase()
}

/// Install the global subscriber. Call once at startup.
///
/// If the incident log cannot be opened, stdout logging still starts and the
/// failure is reported there.
pub fn init_telemetry(config: TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.log_level)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (incident_layer, open_error) = if config.log_to_sqlite {
        match IncidentLog::open(&config.log_db_path) {
            Ok(log) => (Some(IncidentLayer::new(Arc::new(log))), None),
            Err(e) => (None, Some(e)),
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(incident_layer)
        .init();

    if let Some(e) = open_error {
        tracing::warn!(
            path = %config.log_db_path.display(),
            error = %e,
            "incident log unavailable"
        );
    }
}
