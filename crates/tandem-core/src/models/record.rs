//! Synchronized record model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Payload;
use crate::error::Error;

/// Device id stamped on records written by conflict resolution
pub const RESOLUTION_DEVICE_ID: &str = "conflict_resolution";

/// Origin platform of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Mobile,
    Web,
    Extension,
    /// Written by the server while resolving a conflict
    Resolved,
}

impl Platform {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Web => "web",
            Self::Extension => "extension",
            Self::Resolved => "resolved",
        }
    }

    /// Whether a client may claim this platform in a request
    pub const fn is_client(self) -> bool {
        !matches!(self, Self::Resolved)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mobile" => Ok(Self::Mobile),
            "web" => Ok(Self::Web),
            "extension" => Ok(Self::Extension),
            "resolved" => Ok(Self::Resolved),
            other => Err(Error::InvalidInput(format!("Unknown platform: {other}"))),
        }
    }
}

/// Identity of a record within one user's data
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub data_type: String,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(data_type: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            data_type: data_type.into(),
            record_id: record_id.into(),
        }
    }

    /// Change id used by the pending queue (`dataType_recordId`)
    pub fn change_id(&self) -> String {
        format!("{}_{}", self.data_type, self.record_id)
    }

    /// Key of the local cache entry for this record
    pub fn storage_key(&self) -> String {
        format!("sync_{}_{}", self.data_type, self.record_id)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.data_type, self.record_id)
    }
}

/// The unit of synchronization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    /// Business object id, unique within `(user_id, data_type)`
    pub id: String,
    pub user_id: String,
    pub data_type: String,
    pub data: Payload,
    /// Origin of the last write
    pub platform: Platform,
    pub device_id: String,
    /// Server write time (Unix ms)
    pub timestamp: i64,
    /// Concurrency-control version, +1 per successful write
    pub version: u64,
    /// SHA-256 of the canonical payload
    pub checksum: String,
    /// Tombstone flag
    #[serde(default)]
    pub deleted: bool,
}

impl SyncRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.data_type, &self.id)
    }

    /// Whether the stored checksum still matches the payload
    pub fn verify_checksum(&self) -> bool {
        self.data.checksum() == self.checksum
    }
}
