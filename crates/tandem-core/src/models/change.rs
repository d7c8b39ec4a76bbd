//! Pending change model

use serde::{Deserialize, Serialize};

use super::{Payload, RecordKey};
use crate::util::unix_millis_now;

/// Kind of mutation carried by a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A local mutation that the server has not confirmed yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// `dataType_recordId`
    pub id: String,
    pub data_type: String,
    pub record_id: String,
    pub data: Payload,
    pub operation: ChangeOperation,
    /// Local enqueue time (Unix ms)
    pub timestamp: i64,
    /// Client-local version, always 1 for a queued item
    pub version: u64,
    /// Version the client believed it was editing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
}

impl PendingChange {
    pub fn new(
        key: &RecordKey,
        data: Payload,
        operation: ChangeOperation,
        base_version: Option<u64>,
    ) -> Self {
        Self {
            id: key.change_id(),
            data_type: key.data_type.clone(),
            record_id: key.record_id.clone(),
            data,
            operation,
            timestamp: unix_millis_now(),
            version: 1,
            base_version,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.data_type, &self.record_id)
    }

    pub const fn is_delete(&self) -> bool {
        matches!(self.operation, ChangeOperation::Delete)
    }
}
