//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run statements inside one transaction, rolling back on the first failure
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!(version, "Migrated record store schema");
    Ok(())
}

/// Migration to version 1: records and conflicts
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // One row per (user, type, id): the highest version wins the primary key
        "CREATE TABLE IF NOT EXISTS sync_records (
            user_id TEXT NOT NULL,
            data_type TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            platform TEXT NOT NULL,
            device_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            version INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, data_type, id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_records_user_timestamp ON sync_records(user_id, timestamp)",
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            data_type TEXT NOT NULL,
            data_id TEXT NOT NULL,
            versions TEXT NOT NULL,
            severity TEXT NOT NULL,
            suggested_strategy TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            resolved_at INTEGER,
            resolution TEXT,
            resolved_data TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_user_status ON sync_conflicts(user_id, status)",
    ];

    apply(conn, 1, &statements).await
}

/// Migration to version 2: device bookkeeping and request metrics
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS device_sync_status (
            user_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            last_sync INTEGER NOT NULL,
            sync_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, device_id)
        )",
        "CREATE TABLE IF NOT EXISTS sync_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            device_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            success INTEGER NOT NULL,
            changes_count INTEGER NOT NULL,
            conflicts_count INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            timestamp INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_metrics_user ON sync_metrics(user_id, timestamp)",
    ];

    apply(conn, 2, &statements).await
}
