use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tally_core::time;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Latest activity of one device. Continuously refreshed by the device
/// subsystem; the ledger only reads it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub user_id: String,
    pub device_id: String,
    pub last_seen_at: DateTime<Utc>,
    pub client_identifier: String,
}

pub struct DeviceRepo {
    db: Database,
}

impl DeviceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a device or refresh its last-seen time and client identifier.
    #[instrument(skip(self, device), fields(user_id = %device.user_id, device_id = %device.device_id))]
    pub fn upsert(&self, device: &DeviceRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO device_devices (user_id, device_id, last_seen_ts, user_agent)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (user_id, device_id) DO UPDATE SET
                     last_seen_ts = excluded.last_seen_ts,
                     user_agent = excluded.user_agent",
                rusqlite::params![
                    device.user_id,
                    device.device_id,
                    time::to_millis(device.last_seen_at),
                    device.client_identifier,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, user_id: &str, device_id: &str) -> Result<DeviceRecord, StoreError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, device_id, last_seen_ts, user_agent
                     FROM device_devices WHERE user_id = ?1 AND device_id = ?2",
                    [user_id, device_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            let (user_id, device_id, last_seen_ts, client_identifier) = row
                .ok_or_else(|| StoreError::NotFound(format!("device {user_id}/{device_id}")))?;
            Ok(DeviceRecord {
                user_id,
                device_id,
                last_seen_at: row_helpers::parse_timestamp(last_seen_ts, TABLE, "last_seen_ts")?,
                client_identifier,
            })
        })
    }

    /// Distinct users with at least one device seen strictly after `after`.
    #[instrument(skip(self))]
    pub fn count_users_seen_after(&self, after: DateTime<Utc>) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| count_users_seen_after(conn, after))
    }
}

const TABLE: &str = "device_devices";

pub(crate) fn count_users_seen_after(
    conn: &Connection,
    after: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM (
             SELECT user_id FROM device_devices WHERE last_seen_ts > ?1
             GROUP BY user_id
         ) u",
        [time::to_millis(after)],
        |row| row.get(0),
    )?;
    Ok(count)
}
