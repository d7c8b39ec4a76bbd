//! Record store repository implementation

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{
    ConflictRecord, ConflictStatus, ConflictVersion, DeviceSyncStatus, Payload, Platform,
    ResolutionKind, SyncMetric, SyncRecord,
};
use crate::protocol::PullCursor;
use libsql::{params, Connection, Row};

const RECORD_COLUMNS: &str =
    "id, user_id, data_type, data, platform, device_id, timestamp, version, checksum, deleted";

const CONFLICT_COLUMNS: &str = "id, user_id, data_type, data_id, versions, severity, \
     suggested_strategy, status, created_at, expires_at, resolved_at, resolution";

/// Trait for record store operations (async)
#[allow(async_fn_in_trait)]
pub trait RecordRepository {
    /// Get the current record for a key
    async fn get_record(
        &self,
        user_id: &str,
        data_type: &str,
        record_id: &str,
    ) -> Result<Option<SyncRecord>>;

    /// Compare-and-swap write.
    ///
    /// With `expected_version = None` the write only lands if no row exists yet;
    /// otherwise only if the stored version still equals `expected_version`.
    /// Returns whether the row was written.
    async fn write_record(&self, record: &SyncRecord, expected_version: Option<u64>)
        -> Result<bool>;

    /// Records written after `since`, ordered by `(timestamp, data_type, id)`.
    ///
    /// With a cursor, only records strictly after it in that order are returned.
    async fn records_since(
        &self,
        user_id: &str,
        since: i64,
        after: Option<&PullCursor>,
        exclude_device: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncRecord>>;

    async fn insert_conflict(&self, conflict: &ConflictRecord) -> Result<()>;

    async fn get_conflict(&self, user_id: &str, conflict_id: &str)
        -> Result<Option<ConflictRecord>>;

    /// Pending conflicts that have not expired at `now`
    async fn pending_conflicts(&self, user_id: &str, now: i64) -> Result<Vec<ConflictRecord>>;

    /// Mark a pending conflict resolved. Returns false if it was not pending.
    async fn mark_conflict_resolved(
        &self,
        user_id: &str,
        conflict_id: &str,
        resolution: ResolutionKind,
        resolved_data: &Payload,
        resolved_at: i64,
    ) -> Result<bool>;

    /// Record a successful sync request from a device
    async fn touch_device(
        &self,
        user_id: &str,
        device_id: &str,
        platform: Platform,
        now: i64,
    ) -> Result<()>;

    async fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceSyncStatus>>;

    async fn record_metric(&self, metric: &SyncMetric) -> Result<()>;
}

/// libSQL implementation of `RecordRepository`
pub struct LibSqlRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::InvalidInput(format!("Value {value} is out of range for storage")))
}

fn from_sql_int(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Database(format!("Negative counter in store: {value}")))
}

/// Store enums as their serde label
fn to_label<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        Value::String(label) => Ok(label),
        other => Err(Error::Storage(format!("Expected string label, got {other}"))),
    }
}

fn from_label<T: DeserializeOwned>(label: String) -> Result<T> {
    Ok(serde_json::from_value(Value::String(label))?)
}

fn parse_record(row: &Row) -> Result<SyncRecord> {
    let data: String = row.get(3)?;
    let platform: String = row.get(4)?;
    Ok(SyncRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        data_type: row.get(2)?,
        data: serde_json::from_str(&data)?,
        platform: platform.parse()?,
        device_id: row.get(5)?,
        timestamp: row.get(6)?,
        version: from_sql_int(row.get(7)?)?,
        checksum: row.get(8)?,
        deleted: row.get::<i64>(9)? != 0,
    })
}

fn parse_conflict(row: &Row) -> Result<ConflictRecord> {
    let versions: String = row.get(4)?;
    let versions: Vec<ConflictVersion> = serde_json::from_str(&versions)?;
    let resolution = row
        .get::<Option<String>>(11)?
        .map(from_label::<ResolutionKind>)
        .transpose()?;
    Ok(ConflictRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        data_type: row.get(2)?,
        data_id: row.get(3)?,
        versions,
        severity: from_label(row.get(5)?)?,
        suggested_strategy: from_label(row.get(6)?)?,
        status: from_label(row.get(7)?)?,
        created_at: row.get(8)?,
        expires_at: row.get(9)?,
        resolved_at: row.get(10)?,
        resolution,
    })
}

impl RecordRepository for LibSqlRecordRepository<'_> {
    async fn get_record(
        &self,
        user_id: &str,
        data_type: &str,
        record_id: &str,
    ) -> Result<Option<SyncRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records WHERE user_id = ? AND data_type = ? AND id = ?"
        );
        let mut rows = self
            .conn
            .query(&sql, params![user_id, data_type, record_id])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn write_record(
        &self,
        record: &SyncRecord,
        expected_version: Option<u64>,
    ) -> Result<bool> {
        let data = serde_json::to_string(&record.data)?;
        let version = to_sql_int(record.version)?;
        let deleted = i64::from(record.deleted);

        let changed = match expected_version {
            None => {
                self.conn
                    .execute(
                        "INSERT INTO sync_records (id, user_id, data_type, data, platform, device_id, timestamp, version, checksum, deleted)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                         ON CONFLICT(user_id, data_type, id) DO NOTHING",
                        params![
                            record.id.as_str(),
                            record.user_id.as_str(),
                            record.data_type.as_str(),
                            data,
                            record.platform.as_str(),
                            record.device_id.as_str(),
                            record.timestamp,
                            version,
                            record.checksum.as_str(),
                            deleted,
                        ],
                    )
                    .await?
            }
            Some(expected) => {
                self.conn
                    .execute(
                        "UPDATE sync_records
                         SET data = ?, platform = ?, device_id = ?, timestamp = ?, version = ?, checksum = ?, deleted = ?
                         WHERE user_id = ? AND data_type = ? AND id = ? AND version = ?",
                        params![
                            data,
                            record.platform.as_str(),
                            record.device_id.as_str(),
                            record.timestamp,
                            version,
                            record.checksum.as_str(),
                            deleted,
                            record.user_id.as_str(),
                            record.data_type.as_str(),
                            record.id.as_str(),
                            to_sql_int(expected)?,
                        ],
                    )
                    .await?
            }
        };

        Ok(changed == 1)
    }

    async fn records_since(
        &self,
        user_id: &str,
        since: i64,
        after: Option<&PullCursor>,
        exclude_device: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncRecord>> {
        let limit = to_sql_int(limit as u64)?;
        // No cursor starts at `(since, "", "")`, which the `timestamp > since` bound already covers
        let (after_ts, after_type, after_id) = after.map_or((since, "", ""), |cursor| {
            (
                cursor.timestamp,
                cursor.data_type.as_str(),
                cursor.record_id.as_str(),
            )
        });
        let mut rows = match exclude_device {
            Some(device_id) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM sync_records
                     WHERE user_id = ?1 AND timestamp > ?2 AND device_id != ?3
                       AND (timestamp > ?4 OR (timestamp = ?4 AND (data_type > ?5 OR (data_type = ?5 AND id > ?6))))
                     ORDER BY timestamp, data_type, id LIMIT ?7"
                );
                self.conn
                    .query(
                        &sql,
                        params![user_id, since, device_id, after_ts, after_type, after_id, limit],
                    )
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM sync_records
                     WHERE user_id = ?1 AND timestamp > ?2
                       AND (timestamp > ?3 OR (timestamp = ?3 AND (data_type > ?4 OR (data_type = ?4 AND id > ?5))))
                     ORDER BY timestamp, data_type, id LIMIT ?6"
                );
                self.conn
                    .query(
                        &sql,
                        params![user_id, since, after_ts, after_type, after_id, limit],
                    )
                    .await?
            }
        };

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_record(&row)?);
        }
        Ok(records)
    }

    async fn insert_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        let versions = serde_json::to_string(&conflict.versions)?;
        self.conn
            .execute(
                "INSERT INTO sync_conflicts (id, user_id, data_type, data_id, versions, severity, suggested_strategy, status, created_at, expires_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    conflict.id.as_str(),
                    conflict.user_id.as_str(),
                    conflict.data_type.as_str(),
                    conflict.data_id.as_str(),
                    versions,
                    conflict.severity.as_str(),
                    conflict.suggested_strategy.as_str(),
                    to_label(&conflict.status)?,
                    conflict.created_at,
                    conflict.expires_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_conflict(
        &self,
        user_id: &str,
        conflict_id: &str,
    ) -> Result<Option<ConflictRecord>> {
        let sql =
            format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE user_id = ? AND id = ?");
        let mut rows = self.conn.query(&sql, params![user_id, conflict_id]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    async fn pending_conflicts(&self, user_id: &str, now: i64) -> Result<Vec<ConflictRecord>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
             WHERE user_id = ? AND status = ? AND expires_at > ?
             ORDER BY created_at, id"
        );
        let pending = to_label(&ConflictStatus::Pending)?;
        let mut rows = self.conn.query(&sql, params![user_id, pending, now]).await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    async fn mark_conflict_resolved(
        &self,
        user_id: &str,
        conflict_id: &str,
        resolution: ResolutionKind,
        resolved_data: &Payload,
        resolved_at: i64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_conflicts
                 SET status = ?, resolution = ?, resolved_data = ?, resolved_at = ?
                 WHERE user_id = ? AND id = ? AND status = ?",
                params![
                    to_label(&ConflictStatus::Resolved)?,
                    resolution.as_str(),
                    serde_json::to_string(resolved_data)?,
                    resolved_at,
                    user_id,
                    conflict_id,
                    to_label(&ConflictStatus::Pending)?,
                ],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn touch_device(
        &self,
        user_id: &str,
        device_id: &str,
        platform: Platform,
        now: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO device_sync_status (user_id, device_id, platform, last_sync, sync_count)
                 VALUES (?, ?, ?, ?, 1)
                 ON CONFLICT(user_id, device_id) DO UPDATE SET
                     platform = excluded.platform,
                     last_sync = excluded.last_sync,
                     sync_count = sync_count + 1",
                params![user_id, device_id, platform.as_str(), now],
            )
            .await?;
        Ok(())
    }

    async fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceSyncStatus>> {
        let mut rows = self
            .conn
            .query(
                "SELECT user_id, device_id, platform, last_sync, sync_count
                 FROM device_sync_status WHERE user_id = ?
                 ORDER BY last_sync DESC, device_id",
                params![user_id],
            )
            .await?;

        let mut devices = Vec::new();
        while let Some(row) = rows.next().await? {
            let platform: String = row.get(2)?;
            devices.push(DeviceSyncStatus {
                user_id: row.get(0)?,
                device_id: row.get(1)?,
                platform: platform.parse()?,
                last_sync: row.get(3)?,
                sync_count: from_sql_int(row.get(4)?)?,
            });
        }
        Ok(devices)
    }

    async fn record_metric(&self, metric: &SyncMetric) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_metrics (user_id, platform, device_id, operation, success, changes_count, conflicts_count, duration_ms, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    metric.user_id.as_str(),
                    metric.platform.as_str(),
                    metric.device_id.as_str(),
                    metric.operation.as_str(),
                    i64::from(metric.success),
                    to_sql_int(metric.changes_count)?,
                    to_sql_int(metric.conflicts_count)?,
                    to_sql_int(metric.duration_ms)?,
                    metric.timestamp,
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::db::Database;
    use crate::models::{ResolutionStrategy, Severity};

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn record(id: &str, device_id: &str, timestamp: i64, version: u64) -> SyncRecord {
        let data = Payload::new(json!({"theme": "dark", "version": version}));
        SyncRecord {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            data_type: "user_preferences".to_string(),
            checksum: data.checksum(),
            data,
            platform: Platform::Web,
            device_id: device_id.to_string(),
            timestamp,
            version,
            deleted: false,
        }
    }

    fn conflict(id: &str, expires_at: i64) -> ConflictRecord {
        ConflictRecord {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            data_type: "user_preferences".to_string(),
            data_id: "u1".to_string(),
            versions: vec![ConflictVersion {
                version: 2,
                data: Payload::new(json!({"theme": "dark"})),
                timestamp: 1_000,
                platform: Platform::Mobile,
                device_id: "device-a".to_string(),
            }],
            severity: Severity::Medium,
            suggested_strategy: ResolutionStrategy::LatestWins,
            status: ConflictStatus::Pending,
            created_at: 1_000,
            expires_at,
            resolved_at: None,
            resolution: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_first_write_and_get() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        let first = record("u1", "device-a", 10, 1);
        assert!(repo.write_record(&first, None).await.unwrap());

        let loaded = repo
            .get_record("user-1", "user_preferences", "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, first);
        assert!(repo
            .get_record("user-2", "user_preferences", "u1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compare_and_swap_rejects_stale_writes() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        assert!(repo.write_record(&record("u1", "a", 10, 1), None).await.unwrap());
        // A second first-write loses the race
        assert!(!repo.write_record(&record("u1", "b", 11, 1), None).await.unwrap());

        assert!(repo
            .write_record(&record("u1", "a", 12, 2), Some(1))
            .await
            .unwrap());
        assert!(!repo
            .write_record(&record("u1", "b", 13, 2), Some(1))
            .await
            .unwrap());

        let stored = repo
            .get_record("user-1", "user_preferences", "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.device_id, "a");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_records_since_orders_and_filters() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        repo.write_record(&record("c", "device-a", 30, 1), None)
            .await
            .unwrap();
        repo.write_record(&record("a", "device-b", 10, 1), None)
            .await
            .unwrap();
        repo.write_record(&record("b", "device-a", 20, 1), None)
            .await
            .unwrap();

        let all = repo.records_since("user-1", 0, None, None, 10).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let others = repo
            .records_since("user-1", 0, None, Some("device-a"), 10)
            .await
            .unwrap();
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id, "a");

        let after = repo.records_since("user-1", 10, None, None, 1).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, "b");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cursor_pages_through_one_millisecond() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        for id in ["d", "a", "c", "b"] {
            repo.write_record(&record(id, "device-b", 40, 1), None)
                .await
                .unwrap();
        }
        repo.write_record(&record("z", "device-b", 10, 1), None)
            .await
            .unwrap();

        let first = repo.records_since("user-1", 10, None, None, 2).await.unwrap();
        let ids: Vec<&str> = first.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let cursor = PullCursor::after(&first[1]);
        let rest = repo
            .records_since("user-1", 10, Some(&cursor), Some("device-a"), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = rest.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tombstones_round_trip() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        let mut tombstone = record("u1", "device-a", 10, 1);
        tombstone.deleted = true;
        repo.write_record(&tombstone, None).await.unwrap();

        let loaded = repo
            .get_record("user-1", "user_preferences", "u1")
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.deleted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflict_lifecycle() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        repo.insert_conflict(&conflict("conflict_1", 5_000))
            .await
            .unwrap();
        repo.insert_conflict(&conflict("conflict_2", 500))
            .await
            .unwrap();

        let pending = repo.pending_conflicts("user-1", 1_000).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0], conflict("conflict_1", 5_000));

        let data = Payload::new(json!({"theme": "dark"}));
        assert!(repo
            .mark_conflict_resolved("user-1", "conflict_1", ResolutionKind::Override, &data, 2_000)
            .await
            .unwrap());
        assert!(!repo
            .mark_conflict_resolved("user-1", "conflict_1", ResolutionKind::Override, &data, 2_001)
            .await
            .unwrap());

        let resolved = repo
            .get_conflict("user-1", "conflict_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(resolved.resolution, Some(ResolutionKind::Override));
        assert_eq!(resolved.resolved_at, Some(2_000));
        assert!(repo
            .get_conflict("user-2", "conflict_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_device_status_and_metrics() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        repo.touch_device("user-1", "device-a", Platform::Web, 100)
            .await
            .unwrap();
        repo.touch_device("user-1", "device-a", Platform::Web, 200)
            .await
            .unwrap();
        repo.touch_device("user-1", "device-b", Platform::Mobile, 150)
            .await
            .unwrap();

        let devices = repo.list_devices("user-1").await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_id, "device-a");
        assert_eq!(devices[0].sync_count, 2);
        assert_eq!(devices[0].last_sync, 200);
        assert_eq!(devices[1].platform, Platform::Mobile);

        repo.record_metric(&SyncMetric {
            user_id: "user-1".to_string(),
            platform: Platform::Web,
            device_id: "device-a".to_string(),
            operation: "push".to_string(),
            success: true,
            changes_count: 3,
            conflicts_count: 1,
            duration_ms: 12,
            timestamp: 200,
        })
        .await
        .unwrap();

        let mut rows = db
            .connection()
            .query("SELECT COUNT(*) FROM sync_metrics", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }
}
