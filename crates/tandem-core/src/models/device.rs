//! Per-device sync bookkeeping

use serde::{Deserialize, Serialize};

use super::Platform;

/// Last successful sync of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncStatus {
    pub user_id: String,
    pub device_id: String,
    pub platform: Platform,
    /// Unix ms
    pub last_sync: i64,
    pub sync_count: u64,
}

/// One row of request telemetry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetric {
    pub user_id: String,
    pub platform: Platform,
    pub device_id: String,
    pub operation: String,
    pub success: bool,
    pub changes_count: u64,
    pub conflicts_count: u64,
    pub duration_ms: u64,
    /// Unix ms
    pub timestamp: i64,
}
