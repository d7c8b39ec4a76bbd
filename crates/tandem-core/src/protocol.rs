//! Wire types shared by the sync endpoint and its clients.
//!
//! All operations travel over one request/response endpoint and are told apart
//! by the `operation` field. Responses are wrapped in [`ApiEnvelope`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{ConflictRecord, Payload, PendingChange, Platform, ResolutionKind, SyncRecord};
use crate::util::unix_millis_now;

/// Largest number of changes or resolutions accepted in one request
pub const MAX_ITEMS_PER_REQUEST: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Pull,
    Push,
    ConflictResolution,
}

impl SyncOperation {
    pub const ALL: [Self; 3] = [Self::Pull, Self::Push, Self::ConflictResolution];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::ConflictResolution => "conflict_resolution",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|operation| operation.as_str() == value)
    }
}

/// Who is syncing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub user_id: String,
    pub device_id: String,
    pub platform: Platform,
}

impl DeviceIdentity {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>, platform: Platform) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            platform,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub user_id: String,
    pub platform: Platform,
    pub device_id: String,
    pub operation: SyncOperation,
    #[serde(default)]
    pub last_sync_timestamp: i64,
    /// Resume point inside a pull that spans several pages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<PullCursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SyncData>,
}

impl SyncRequest {
    fn new(identity: &DeviceIdentity, operation: SyncOperation, last_sync_timestamp: i64) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            platform: identity.platform,
            device_id: identity.device_id.clone(),
            operation,
            last_sync_timestamp,
            cursor: None,
            data: None,
        }
    }

    pub fn pull(identity: &DeviceIdentity, last_sync_timestamp: i64) -> Self {
        Self::new(identity, SyncOperation::Pull, last_sync_timestamp)
    }

    /// Continue a pull after the last record of the previous page
    #[must_use]
    pub fn with_cursor(mut self, cursor: Option<PullCursor>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn push(identity: &DeviceIdentity, last_sync_timestamp: i64, changes: Vec<PendingChange>) -> Self {
        Self {
            data: Some(SyncData::Push(PushData { changes })),
            ..Self::new(identity, SyncOperation::Push, last_sync_timestamp)
        }
    }

    pub fn resolve(identity: &DeviceIdentity, resolutions: Vec<ConflictResolution>) -> Self {
        Self {
            data: Some(SyncData::Resolutions(ResolutionData { resolutions })),
            ..Self::new(identity, SyncOperation::ConflictResolution, 0)
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.user_id, &self.device_id, self.platform)
    }

    pub fn changes(&self) -> &[PendingChange] {
        match &self.data {
            Some(SyncData::Push(data)) => &data.changes,
            _ => &[],
        }
    }

    pub fn resolutions(&self) -> &[ConflictResolution] {
        match &self.data {
            Some(SyncData::Resolutions(data)) => &data.resolutions,
            _ => &[],
        }
    }
}

/// Position in the `(timestamp, dataType, id)` order records are served in.
///
/// Many records can share one timestamp, so a timestamp alone cannot say where
/// a page ended.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullCursor {
    pub timestamp: i64,
    pub data_type: String,
    pub record_id: String,
}

impl PullCursor {
    /// The cursor that resumes right after `record`
    pub fn after(record: &SyncRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            data_type: record.data_type.clone(),
            record_id: record.id.clone(),
        }
    }
}

/// Operation-specific request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncData {
    Push(PushData),
    Resolutions(ResolutionData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushData {
    pub changes: Vec<PendingChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionData {
    pub resolutions: Vec<ConflictResolution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub conflict_id: String,
    pub resolution: ResolutionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_data: Option<Payload>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Machine-readable failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    AuthFailed,
    InvalidOperation,
    SyncError,
    MethodNotAllowed,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub timestamp: i64,
}

impl<T> ApiEnvelope<T> {
    pub fn success(result: T) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            code: None,
            timestamp: unix_millis_now(),
        }
    }

    pub fn failure(error: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            code: Some(code),
            timestamp: unix_millis_now(),
        }
    }
}

/// Changes of one data type inside a pull page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeChanges {
    pub changes: Vec<SyncRecord>,
    pub total_count: usize,
    pub last_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResult {
    pub changes: BTreeMap<String, TypeChanges>,
    #[serde(default)]
    pub conflicts: Vec<ConflictRecord>,
    pub has_more: bool,
    pub last_sync_timestamp: i64,
    pub total_changes: usize,
    /// Where the next page starts; set only when `has_more`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<PullCursor>,
}

impl PullResult {
    /// Group records by data type, keeping their order inside each group
    pub fn from_records(
        records: Vec<SyncRecord>,
        conflicts: Vec<ConflictRecord>,
        has_more: bool,
        last_sync_timestamp: i64,
    ) -> Self {
        let total_changes = records.len();
        let next_cursor = if has_more {
            records.last().map(PullCursor::after)
        } else {
            None
        };
        let mut changes: BTreeMap<String, TypeChanges> = BTreeMap::new();
        for record in records {
            let group = changes
                .entry(record.data_type.clone())
                .or_insert_with(|| TypeChanges {
                    changes: Vec::new(),
                    total_count: 0,
                    last_timestamp: 0,
                });
            group.total_count += 1;
            group.last_timestamp = group.last_timestamp.max(record.timestamp);
            group.changes.push(record);
        }

        Self {
            changes,
            conflicts,
            has_more,
            last_sync_timestamp,
            total_changes,
            next_cursor,
        }
    }

    /// All records across groups in the order the server paged them
    pub fn into_records(self) -> Vec<SyncRecord> {
        let mut records: Vec<SyncRecord> = self
            .changes
            .into_values()
            .flat_map(|group| group.changes)
            .collect();
        records.sort_by(|a, b| {
            (a.timestamp, &a.data_type, &a.id).cmp(&(b.timestamp, &b.data_type, &b.id))
        });
        records
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeError {
    pub change_id: String,
    pub error: String,
    /// The change was valid but could not be stored; send it again later
    #[serde(default)]
    pub retryable: bool,
}

/// A change the server wrote (or found already written)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedChange {
    pub change_id: String,
    pub data_type: String,
    pub record_id: String,
    pub version: u64,
    pub checksum: String,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub successful: usize,
    pub failed: usize,
    pub conflicts: usize,
    #[serde(default)]
    pub errors: Vec<ChangeError>,
    #[serde(default)]
    pub applied: Vec<AppliedChange>,
    #[serde(default)]
    pub conflict_records: Vec<ConflictRecord>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionError {
    pub conflict_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub resolved: usize,
    pub failed: usize,
    #[serde(default)]
    pub errors: Vec<ResolutionError>,
    #[serde(default)]
    pub records: Vec<SyncRecord>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::models::{ChangeOperation, RecordKey};

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("user-1", "device-a", Platform::Mobile)
    }

    #[test]
    fn push_request_serializes_changes_under_data() {
        let change = PendingChange::new(
            &RecordKey::new("user_preferences", "u1"),
            Payload::new(json!({"theme": "dark"})),
            ChangeOperation::Update,
            Some(1),
        );
        let request = SyncRequest::push(&identity(), 10, vec![change]);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["operation"], "push");
        assert_eq!(value["userId"], "user-1");
        assert_eq!(value["lastSyncTimestamp"], 10);
        assert_eq!(value["data"]["changes"][0]["baseVersion"], 1);
    }

    #[test]
    fn resolution_request_round_trips() {
        let request = SyncRequest::resolve(
            &identity(),
            vec![ConflictResolution {
                conflict_id: "conflict_1".to_string(),
                resolution: ResolutionKind::Override,
                resolved_data: Some(Payload::new(json!({"theme": "dark"}))),
                timestamp: 5,
            }],
        );
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: SyncRequest = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, request);
        assert_eq!(decoded.resolutions().len(), 1);
        assert!(decoded.changes().is_empty());
    }

    #[test]
    fn operation_labels_parse() {
        assert_eq!(SyncOperation::parse("conflict_resolution"), Some(SyncOperation::ConflictResolution));
        assert_eq!(SyncOperation::parse("merge"), None);
    }

    #[test]
    fn failure_envelope_omits_result() {
        let envelope = ApiEnvelope::<()>::failure("User ID is required", ErrorCode::InvalidRequest);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["code"], "INVALID_REQUEST");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn failure_envelope_decodes_without_result() {
        let envelope: ApiEnvelope<PushResult> = serde_json::from_value(json!({
            "success": false,
            "error": "Internal sync error",
            "code": "SYNC_ERROR",
            "timestamp": 1
        }))
        .unwrap();
        assert!(envelope.result.is_none());
        assert_eq!(envelope.code, Some(ErrorCode::SyncError));
    }

    #[test]
    fn pull_cursor_travels_only_when_set() {
        let plain = serde_json::to_value(SyncRequest::pull(&identity(), 7)).unwrap();
        assert!(plain.get("cursor").is_none());

        let cursor = PullCursor {
            timestamp: 7,
            data_type: "notes".to_string(),
            record_id: "n1".to_string(),
        };
        let request = SyncRequest::pull(&identity(), 7).with_cursor(Some(cursor.clone()));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value["cursor"],
            json!({"timestamp": 7, "dataType": "notes", "recordId": "n1"})
        );
        let decoded: SyncRequest = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.cursor, Some(cursor));
    }

    #[test]
    fn change_errors_default_to_final() {
        let error: ChangeError =
            serde_json::from_value(json!({"changeId": "notes_n1", "error": "bad"})).unwrap();
        assert!(!error.retryable);
    }

    #[test]
    fn pull_result_groups_by_data_type() {
        let record = |data_type: &str, id: &str, timestamp: i64| SyncRecord {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            data_type: data_type.to_string(),
            data: Payload::null(),
            platform: Platform::Web,
            device_id: "device-b".to_string(),
            timestamp,
            version: 1,
            checksum: Payload::null().checksum(),
            deleted: false,
        };

        let result = PullResult::from_records(
            vec![record("b", "1", 10), record("a", "2", 20), record("b", "3", 30)],
            Vec::new(),
            false,
            30,
        );

        assert_eq!(result.total_changes, 3);
        assert!(result.next_cursor.is_none());
        assert_eq!(result.changes["b"].total_count, 2);
        assert_eq!(result.changes["b"].last_timestamp, 30);
        let ids: Vec<String> = result.into_records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn partial_page_points_past_its_last_record() {
        let record = |data_type: &str, id: &str| SyncRecord {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            data_type: data_type.to_string(),
            data: Payload::null(),
            platform: Platform::Web,
            device_id: "device-b".to_string(),
            timestamp: 50,
            version: 1,
            checksum: Payload::null().checksum(),
            deleted: false,
        };

        let result = PullResult::from_records(
            vec![record("a", "2"), record("b", "1")],
            Vec::new(),
            true,
            49,
        );
        assert_eq!(
            result.next_cursor,
            Some(PullCursor {
                timestamp: 50,
                data_type: "b".to_string(),
                record_id: "1".to_string(),
            })
        );
        let ids: Vec<String> = result.into_records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }
}
