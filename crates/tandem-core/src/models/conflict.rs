//! Sync conflict model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Payload, Platform, RecordKey};

/// How far apart two competing versions are
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Resolution proposed by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    AutoMerge,
    ManualReview,
    LatestWins,
}

impl ResolutionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AutoMerge => "auto_merge",
            Self::ManualReview => "manual_review",
            Self::LatestWins => "latest_wins",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// Resolution chosen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionKind {
    Merge,
    Override,
    Manual,
}

impl ResolutionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Override => "override",
            Self::Manual => "manual",
        }
    }
}

/// One side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictVersion {
    pub version: u64,
    pub data: Payload,
    pub timestamp: i64,
    pub platform: Platform,
    pub device_id: String,
}

/// Competing writes to the same record, kept until someone resolves them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub user_id: String,
    pub data_type: String,
    pub data_id: String,
    /// Stored version first, rejected incoming version second
    pub versions: Vec<ConflictVersion>,
    pub severity: Severity,
    pub suggested_strategy: ResolutionStrategy,
    pub status: ConflictStatus,
    /// Unix ms
    pub created_at: i64,
    /// Unix ms after which a pending conflict is stale
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionKind>,
}

impl ConflictRecord {
    pub fn new_id() -> String {
        format!("conflict_{}", Uuid::now_v7())
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.data_type, &self.data_id)
    }

    pub fn is_stale(&self, now: i64) -> bool {
        self.status == ConflictStatus::Pending && now >= self.expires_at
    }

    /// Highest version among the competing entries
    pub fn max_version(&self) -> u64 {
        self.versions
            .iter()
            .map(|version| version.version)
            .max()
            .unwrap_or(0)
    }

    pub fn involves_device(&self, device_id: &str) -> bool {
        self.versions
            .iter()
            .any(|version| version.device_id == device_id)
    }
}
