//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TallySettings::default()`]
//! 2. If `~/.tally/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `TALLY_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{tally_dir, TallySettings};

/// Resolve the path to the settings file (`~/.tally/settings.json`).
pub fn settings_path() -> PathBuf {
    tally_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TallySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// [`TallySettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TallySettings> {
    let defaults = serde_json::to_value(TallySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TallySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` leave `target` untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and the file/default value stays.
pub fn apply_env_overrides(settings: &mut TallySettings) {
    if let Some(v) = read_env_string("TALLY_DB_PATH") {
        settings.database.path = PathBuf::from(v);
    }

    if let Some(v) = read_env_bool("TALLY_MATERIALIZE_ENABLED") {
        settings.materializer.enabled = v;
    }
    if let Some(v) = read_env_u64("TALLY_MATERIALIZE_INITIAL_DELAY_SECS", 0, 86_400) {
        settings.materializer.initial_delay_secs = v;
    }
    if let Some(v) = read_env_u64("TALLY_MATERIALIZE_INTERVAL_SECS", 60, 604_800) {
        settings.materializer.interval_secs = v;
    }

    if let Some(v) = read_env_string("TALLY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("TALLY_LOG_TO_SQLITE") {
        settings.logging.log_to_sqlite = v;
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
