/// SQL DDL for the tally database.
/// All timestamps are integer milliseconds since the Unix epoch (UTC).
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS account_accounts (
    user_id TEXT PRIMARY KEY,
    created_ts INTEGER NOT NULL,
    account_type INTEGER NOT NULL,
    appservice_id TEXT
);

CREATE TABLE IF NOT EXISTS device_devices (
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    last_seen_ts INTEGER NOT NULL,
    user_agent TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (user_id, device_id)
);

-- At most one visit per user, device and day
CREATE TABLE IF NOT EXISTS user_daily_visits (
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    user_agent TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_visits_user_device_ts ON user_daily_visits(user_id, device_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_visits_ts ON user_daily_visits(timestamp);
CREATE INDEX IF NOT EXISTS idx_visits_user_ts ON user_daily_visits(user_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON device_devices(last_seen_ts);
CREATE INDEX IF NOT EXISTS idx_accounts_type ON account_accounts(account_type);
CREATE INDEX IF NOT EXISTS idx_accounts_created ON account_accounts(created_ts);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

/// Product name reported alongside snapshots.
pub const ENGINE_NAME: &str = "SQLite";
