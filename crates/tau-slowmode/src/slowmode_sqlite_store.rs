//! SQLite-backed `LeaseStore` so leases survive process restarts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::slowmode_store::{
    ActiveLease, LeaseCreation, LeaseStore, LeaseStoreError, LeaseStoreResult, NewLease,
    SlowmodeConfig,
};

const LEASE_COLUMNS: &str =
    "lease_id, channel_id, user_id, created_unix_ms, expires_unix_ms";
const CONFIG_COLUMNS: &str =
    "channel_id, slowmode_seconds, enabled, exempt_role_ids_json, updated_unix_ms";

/// Persistent SQLite store backend for slowmode configs and leases.
#[derive(Debug)]
pub struct SqliteLeaseStore {
    db_path: PathBuf,
}

impl SqliteLeaseStore {
    /// Opens (or creates) the database at `path` and ensures the schema exists.
    pub fn new(path: impl AsRef<Path>) -> LeaseStoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> LeaseStoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }
}

fn initialize_schema(connection: &Connection) -> LeaseStoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS slowmode_channels (
            channel_id TEXT PRIMARY KEY,
            slowmode_seconds INTEGER NOT NULL,
            enabled INTEGER NOT NULL,
            exempt_role_ids_json TEXT NOT NULL,
            updated_unix_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS slowmode_leases (
            lease_id TEXT NOT NULL UNIQUE,
            channel_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            created_unix_ms INTEGER NOT NULL,
            expires_unix_ms INTEGER NOT NULL,
            PRIMARY KEY (channel_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_slowmode_leases_expiry
            ON slowmode_leases (expires_unix_ms);
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn load_config(&self, channel_id: &str) -> LeaseStoreResult<Option<SlowmodeConfig>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                &format!("SELECT {CONFIG_COLUMNS} FROM slowmode_channels WHERE channel_id = ?1"),
                params![channel_id],
                raw_config_from_row,
            )
            .optional()?;
        row.map(RawConfigRow::into_config).transpose()
    }

    async fn save_config(&self, config: SlowmodeConfig) -> LeaseStoreResult<()> {
        if config.channel_id.trim().is_empty() {
            return Err(LeaseStoreError::InvalidRequest(
                "slowmode config channel_id cannot be empty".to_string(),
            ));
        }
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO slowmode_channels (
                channel_id, slowmode_seconds, enabled, exempt_role_ids_json, updated_unix_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(channel_id) DO UPDATE SET
                slowmode_seconds = excluded.slowmode_seconds,
                enabled = excluded.enabled,
                exempt_role_ids_json = excluded.exempt_role_ids_json,
                updated_unix_ms = excluded.updated_unix_ms
            "#,
            params![
                config.channel_id,
                u64_to_i64("slowmode_seconds", config.slowmode_seconds)?,
                config.enabled,
                serde_json::to_string(&config.exempt_role_ids)?,
                u64_to_i64("updated_unix_ms", config.updated_unix_ms)?,
            ],
        )?;
        Ok(())
    }

    async fn delete_config(&self, channel_id: &str) -> LeaseStoreResult<bool> {
        let connection = self.open_connection()?;
        let deleted = connection.execute(
            "DELETE FROM slowmode_channels WHERE channel_id = ?1",
            params![channel_id],
        )?;
        Ok(deleted > 0)
    }

    async fn list_configs(&self) -> LeaseStoreResult<Vec<SlowmodeConfig>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {CONFIG_COLUMNS} FROM slowmode_channels ORDER BY channel_id"
        ))?;
        let rows = statement
            .query_map([], raw_config_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawConfigRow::into_config).collect()
    }

    async fn lease_record(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> LeaseStoreResult<Option<ActiveLease>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {LEASE_COLUMNS} FROM slowmode_leases WHERE channel_id = ?1 AND user_id = ?2"
                ),
                params![channel_id, user_id],
                raw_lease_from_row,
            )
            .optional()?;
        row.map(RawLeaseRow::into_lease).transpose()
    }

    async fn create_lease(&self, request: NewLease) -> LeaseStoreResult<LeaseCreation> {
        request.validate()?;

        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = transaction
            .query_row(
                &format!(
                    "SELECT {LEASE_COLUMNS} FROM slowmode_leases WHERE channel_id = ?1 AND user_id = ?2"
                ),
                params![request.channel_id, request.user_id],
                raw_lease_from_row,
            )
            .optional()?
            .map(RawLeaseRow::into_lease)
            .transpose()?;
        if let Some(existing) = existing {
            if existing.is_active_at(request.created_unix_ms) {
                transaction.commit()?;
                return Ok(LeaseCreation::AlreadyActive(existing));
            }
        }

        let lease = ActiveLease {
            lease_id: crate::slowmode_store::next_lease_id(),
            channel_id: request.channel_id,
            user_id: request.user_id,
            created_unix_ms: request.created_unix_ms,
            expires_unix_ms: request.expires_unix_ms,
        };
        transaction.execute(
            r#"
            INSERT OR REPLACE INTO slowmode_leases (
                lease_id, channel_id, user_id, created_unix_ms, expires_unix_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                lease.lease_id,
                lease.channel_id,
                lease.user_id,
                u64_to_i64("created_unix_ms", lease.created_unix_ms)?,
                u64_to_i64("expires_unix_ms", lease.expires_unix_ms)?,
            ],
        )?;
        transaction.commit()?;
        Ok(LeaseCreation::Created(lease))
    }

    async fn delete_lease(&self, lease_id: &str) -> LeaseStoreResult<bool> {
        let connection = self.open_connection()?;
        let deleted = connection.execute(
            "DELETE FROM slowmode_leases WHERE lease_id = ?1",
            params![lease_id],
        )?;
        Ok(deleted > 0)
    }

    async fn list_leases(&self, channel_id: Option<&str>) -> LeaseStoreResult<Vec<ActiveLease>> {
        let connection = self.open_connection()?;
        let rows = match channel_id {
            Some(channel_id) => {
                let mut statement = connection.prepare(&format!(
                    "SELECT {LEASE_COLUMNS} FROM slowmode_leases WHERE channel_id = ?1 ORDER BY channel_id, user_id"
                ))?;
                let rows = statement
                    .query_map(params![channel_id], raw_lease_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut statement = connection.prepare(&format!(
                    "SELECT {LEASE_COLUMNS} FROM slowmode_leases ORDER BY channel_id, user_id"
                ))?;
                let rows = statement
                    .query_map([], raw_lease_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        rows.into_iter().map(RawLeaseRow::into_lease).collect()
    }

    async fn expired_leases(&self, now_unix_ms: u64) -> LeaseStoreResult<Vec<ActiveLease>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {LEASE_COLUMNS} FROM slowmode_leases WHERE expires_unix_ms <= ?1 ORDER BY channel_id, user_id"
        ))?;
        let rows = statement
            .query_map(
                params![u64_to_i64("now_unix_ms", now_unix_ms)?],
                raw_lease_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawLeaseRow::into_lease).collect()
    }
}

struct RawConfigRow {
    channel_id: String,
    slowmode_seconds: i64,
    enabled: bool,
    exempt_role_ids_json: String,
    updated_unix_ms: i64,
}

impl RawConfigRow {
    fn into_config(self) -> LeaseStoreResult<SlowmodeConfig> {
        Ok(SlowmodeConfig {
            channel_id: self.channel_id,
            slowmode_seconds: i64_to_u64("slowmode_seconds", self.slowmode_seconds)?,
            enabled: self.enabled,
            exempt_role_ids: serde_json::from_str(&self.exempt_role_ids_json)?,
            updated_unix_ms: i64_to_u64("updated_unix_ms", self.updated_unix_ms)?,
        })
    }
}

fn raw_config_from_row(row: &Row<'_>) -> rusqlite::Result<RawConfigRow> {
    Ok(RawConfigRow {
        channel_id: row.get(0)?,
        slowmode_seconds: row.get(1)?,
        enabled: row.get(2)?,
        exempt_role_ids_json: row.get(3)?,
        updated_unix_ms: row.get(4)?,
    })
}

struct RawLeaseRow {
    lease_id: String,
    channel_id: String,
    user_id: String,
    created_unix_ms: i64,
    expires_unix_ms: i64,
}

impl RawLeaseRow {
    fn into_lease(self) -> LeaseStoreResult<ActiveLease> {
        Ok(ActiveLease {
            lease_id: self.lease_id,
            channel_id: self.channel_id,
            user_id: self.user_id,
            created_unix_ms: i64_to_u64("created_unix_ms", self.created_unix_ms)?,
            expires_unix_ms: i64_to_u64("expires_unix_ms", self.expires_unix_ms)?,
        })
    }
}

fn raw_lease_from_row(row: &Row<'_>) -> rusqlite::Result<RawLeaseRow> {
    Ok(RawLeaseRow {
        lease_id: row.get(0)?,
        channel_id: row.get(1)?,
        user_id: row.get(2)?,
        created_unix_ms: row.get(3)?,
        expires_unix_ms: row.get(4)?,
    })
}

fn u64_to_i64(field: &'static str, value: u64) -> LeaseStoreResult<i64> {
    i64::try_from(value).map_err(|_| LeaseStoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn i64_to_u64(field: &'static str, value: i64) -> LeaseStoreResult<u64> {
    u64::try_from(value).map_err(|_| LeaseStoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::SqliteLeaseStore;
    use crate::{LeaseStore, NewLease, SlowmodeConfig};
    use tempfile::tempdir;

    fn new_lease(user_id: &str, created: u64, expires: u64) -> NewLease {
        NewLease {
            channel_id: "c-1".to_string(),
            user_id: user_id.to_string(),
            created_unix_ms: created,
            expires_unix_ms: expires,
        }
    }

    #[tokio::test]
    async fn integration_persists_configs_and_leases_across_reopen() {
        let temp = tempdir().expect("create tempdir");
        let db_path = temp.path().join("state").join("slowmode.sqlite");

        let lease = {
            let store = SqliteLeaseStore::new(&db_path).expect("create sqlite store");
            store
                .save_config(
                    SlowmodeConfig::new("c-1", 45).with_exempt_roles(vec!["r-mod".to_string()]),
                )
                .await
                .expect("save config");
            store
                .create_lease(new_lease("u-1", 1_000, 46_000))
                .await
                .expect("create lease")
                .into_lease()
        };

        let reopened = SqliteLeaseStore::new(&db_path).expect("reopen sqlite store");
        let config = reopened
            .load_config("c-1")
            .await
            .expect("load config")
            .expect("config exists");
        assert_eq!(config.slowmode_seconds, 45);
        assert_eq!(config.exempt_role_ids, vec!["r-mod".to_string()]);

        let record = reopened
            .lease_record("c-1", "u-1")
            .await
            .expect("load lease")
            .expect("lease exists");
        assert_eq!(record, lease);
        assert!(reopened
            .has_active_lease("c-1", "u-1", 45_999)
            .await
            .expect("active check"));
        assert!(!reopened
            .has_active_lease("c-1", "u-1", 46_000)
            .await
            .expect("expired check"));
    }

    #[tokio::test]
    async fn functional_create_lease_keeps_active_record_and_replaces_expired() {
        let temp = tempdir().expect("create tempdir");
        let store = SqliteLeaseStore::new(temp.path().join("slowmode.sqlite")).expect("store");

        let first = store
            .create_lease(new_lease("u-1", 1_000, 2_000))
            .await
            .expect("first");
        let duplicate = store
            .create_lease(new_lease("u-1", 1_500, 2_500))
            .await
            .expect("duplicate");
        assert!(first.was_created());
        assert!(!duplicate.was_created());
        assert_eq!(duplicate.lease(), first.lease());

        let replaced = store
            .create_lease(new_lease("u-1", 2_000, 3_000))
            .await
            .expect("replace expired");
        assert!(replaced.was_created());
        assert_eq!(store.list_leases(None).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn functional_expired_scan_filters_by_deadline() {
        let temp = tempdir().expect("create tempdir");
        let store = SqliteLeaseStore::new(temp.path().join("slowmode.sqlite")).expect("store");
        store
            .create_lease(new_lease("u-1", 1_000, 2_000))
            .await
            .expect("short lease");
        store
            .create_lease(new_lease("u-2", 1_000, 9_000))
            .await
            .expect("long lease");

        let expired = store.expired_leases(5_000).await.expect("scan");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].user_id, "u-1");

        assert!(store
            .delete_lease(&expired[0].lease_id)
            .await
            .expect("delete"));
        assert_eq!(store.list_leases(Some("c-1")).await.expect("list").len(), 1);
    }
}
