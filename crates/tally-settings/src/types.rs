//! Settings shapes. All structs deserialize with `#[serde(default)]` so a
//! partial settings file only overrides what it names.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallySettings {
    pub database: DatabaseSettings,
    pub materializer: MaterializerSettings,
    pub logging: LoggingSettings,
}

impl TallySettings {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.materializer.interval_secs == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "materializer.intervalSecs must be positive".to_string(),
            ));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(crate::SettingsError::InvalidValue(
                "database.path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// SQLite file holding accounts, devices and daily visits.
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: tally_dir().join("database/tally.db"),
        }
    }
}

/// Background daily-visit materialization.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaterializerSettings {
    pub enabled: bool,
    /// Delay before the first run after startup.
    pub initial_delay_secs: u64,
    /// Pause between the end of one run and the start of the next.
    pub interval_secs: u64,
}

impl MaterializerSettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for MaterializerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_secs: 5 * 60,
            interval_secs: 3 * 60 * 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter; `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Persist WARN and above to a separate SQLite log database.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: tally_dir().join("database/logs.db"),
        }
    }
}

/// `~/.tally`, or `/tmp/.tally` without a home directory.
pub fn tally_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".tally")
}
