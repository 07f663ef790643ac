use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tally_core::{time, AccountKind, RegistrationType};
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: AccountKind,
    /// Owning application service, for bridged accounts.
    pub appservice_id: Option<String>,
}

impl AccountRecord {
    pub fn is_bridged(&self) -> bool {
        self.appservice_id.is_some()
    }
}

/// Accounts are written by the account service; this repo reads them and
/// offers `insert` for seeding.
pub struct AccountRepo {
    db: Database,
}

impl AccountRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, account), fields(user_id = %account.user_id, kind = %account.kind))]
    pub fn insert(&self, account: &AccountRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO account_accounts (user_id, created_ts, account_type, appservice_id)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    account.user_id,
                    time::to_millis(account.created_at),
                    account.kind.code(),
                    account.appservice_id,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, user_id: &str) -> Result<AccountRecord, StoreError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, created_ts, account_type, appservice_id
                     FROM account_accounts WHERE user_id = ?1",
                    [user_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .optional()?;

            let (user_id, created_ts, code, appservice_id) =
                row.ok_or_else(|| StoreError::NotFound(format!("account {user_id}")))?;
            Ok(AccountRecord {
                user_id,
                created_at: row_helpers::parse_timestamp(created_ts, TABLE, "created_ts")?,
                kind: row_helpers::parse_account_kind(code, TABLE, "account_type")?,
                appservice_id,
            })
        })
    }

    /// Number of accounts whose kind is in `kinds`.
    #[instrument(skip(self))]
    pub fn count_by_kinds(&self, kinds: &[AccountKind]) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| count_by_kinds(conn, kinds))
    }

    /// Accounts created after `created_after`, bucketed as native, guest or bridged.
    #[instrument(skip(self))]
    pub fn registered_by_type(
        &self,
        created_after: DateTime<Utc>,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        self.db
            .with_conn(|conn| registered_by_type(conn, created_after))
    }
}

const TABLE: &str = "account_accounts";

pub(crate) fn count_by_kinds(conn: &Connection, kinds: &[AccountKind]) -> Result<i64, StoreError> {
    if kinds.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "SELECT COUNT(*) FROM account_accounts WHERE account_type IN ({})",
        row_helpers::placeholders(1, kinds.len())
    );
    let count = conn.query_row(&sql, params_from_iter(kinds.iter().map(AccountKind::code)), |row| {
        row.get(0)
    })?;
    Ok(count)
}

pub(crate) fn registered_by_type(
    conn: &Connection,
    created_after: DateTime<Utc>,
) -> Result<BTreeMap<String, i64>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT account_type, appservice_id IS NOT NULL, COUNT(*)
         FROM account_accounts
         WHERE created_ts > ?1
         GROUP BY account_type, appservice_id IS NOT NULL",
    )?;
    let mut rows = stmt.query([time::to_millis(created_after)])?;

    let mut result = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let code: i64 = row_helpers::get(row, 0, TABLE, "account_type")?;
        let bridged: bool = row_helpers::get(row, 1, TABLE, "appservice_id")?;
        let count: i64 = row_helpers::get(row, 2, TABLE, "count")?;
        let kind = row_helpers::parse_account_kind(code, TABLE, "account_type")?;
        if let Some(bucket) = RegistrationType::of(kind, bridged) {
            *result.entry(bucket.as_str().to_string()).or_insert(0) += count;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn account(user_id: &str, kind: AccountKind, created_at: DateTime<Utc>) -> AccountRecord {
        AccountRecord {
            user_id: user_id.to_string(),
            created_at,
            kind,
            appservice_id: None,
        }
    }

    fn bridged(user_id: &str, kind: AccountKind, created_at: DateTime<Utc>) -> AccountRecord {
        AccountRecord {
            appservice_id: Some("irc".to_string()),
            ..account(user_id, kind, created_at)
        }
    }

    #[test]
    fn insert_and_get() {
        let repo = AccountRepo::new(Database::in_memory().unwrap());
        let created = time::from_millis(1_700_000_000_000).unwrap();
        repo.insert(&bridged("alice", AccountKind::Admin, created)).unwrap();

        let got = repo.get("alice").unwrap();
        assert_eq!(got.kind, AccountKind::Admin);
        assert_eq!(got.created_at, created);
        assert!(got.is_bridged());
    }

    #[test]
    fn get_missing_is_not_found() {
        let repo = AccountRepo::new(Database::in_memory().unwrap());
        assert!(matches!(repo.get("nobody"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn duplicate_insert_is_conflict() {
        let repo = AccountRepo::new(Database::in_memory().unwrap());
        let now = Utc::now();
        repo.insert(&account("bob", AccountKind::User, now)).unwrap();
        let err = repo.insert(&account("bob", AccountKind::Guest, now)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn count_by_kinds_filters() {
        let repo = AccountRepo::new(Database::in_memory().unwrap());
        let now = Utc::now();
        repo.insert(&account("u1", AccountKind::User, now)).unwrap();
        repo.insert(&account("u2", AccountKind::Guest, now)).unwrap();
        repo.insert(&account("u3", AccountKind::Admin, now)).unwrap();
        repo.insert(&account("u4", AccountKind::AppService, now)).unwrap();

        assert_eq!(repo.count_by_kinds(&AccountKind::ALL).unwrap(), 4);
        assert_eq!(repo.count_by_kinds(&AccountKind::NON_BRIDGED).unwrap(), 3);
        assert_eq!(repo.count_by_kinds(&[AccountKind::Guest]).unwrap(), 1);
        assert_eq!(repo.count_by_kinds(&[]).unwrap(), 0);
    }

    #[test]
    fn registered_by_type_buckets_recent_accounts() {
        let repo = AccountRepo::new(Database::in_memory().unwrap());
        let now = Utc::now();
        let recent = now - Duration::hours(2);
        let old = now - Duration::days(3);

        repo.insert(&account("native1", AccountKind::User, recent)).unwrap();
        repo.insert(&account("native2", AccountKind::Admin, recent)).unwrap();
        repo.insert(&account("native3", AccountKind::AppService, recent)).unwrap();
        repo.insert(&account("guest1", AccountKind::Guest, recent)).unwrap();
        repo.insert(&bridged("bridged1", AccountKind::User, recent)).unwrap();
        repo.insert(&bridged("orphan", AccountKind::Guest, recent)).unwrap();
        repo.insert(&account("old", AccountKind::User, old)).unwrap();

        let result = repo.registered_by_type(now - Duration::days(1)).unwrap();
        assert_eq!(result.get("native"), Some(&3));
        assert_eq!(result.get("guest"), Some(&1));
        assert_eq!(result.get("bridged"), Some(&1));
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn registered_by_type_empty_when_nothing_recent() {
        let repo = AccountRepo::new(Database::in_memory().unwrap());
        let now = Utc::now();
        repo.insert(&account("old", AccountKind::User, now - Duration::days(10))).unwrap();
        assert!(repo.registered_by_type(now - Duration::days(1)).unwrap().is_empty());
    }
}
