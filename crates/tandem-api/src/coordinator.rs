//! Server-side sync operations.
//!
//! The coordinator keeps no state between requests. Every write goes through the
//! repository's compare-and-swap, so two requests racing on one record end with
//! one write and one conflict.

use std::collections::HashSet;

use serde::Serialize;
use tandem_core::conflict;
use tandem_core::db::RecordRepository;
use tandem_core::models::{
    ConflictRecord, ConflictStatus, ConflictVersion, Payload, PendingChange, Platform,
    RecordKey, ResolutionKind, SyncRecord, RESOLUTION_DEVICE_ID,
};
use tandem_core::protocol::{
    AppliedChange, ChangeError, ConflictResolution, PullResult, PushResult, ResolutionError,
    ResolutionResult, SyncOperation, SyncRequest,
};
use tandem_core::{Error, Result};

use crate::config::AppConfig;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_CONFLICT_TTL_MS: i64 = 300_000;

const RESOLVE_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub page_size: usize,
    pub conflict_ttl_ms: i64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            conflict_ttl_ms: DEFAULT_CONFLICT_TTL_MS,
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            page_size: config.pull_page_size,
            conflict_ttl_ms: i64::try_from(config.conflict_ttl.as_millis())
                .unwrap_or(DEFAULT_CONFLICT_TTL_MS),
        }
    }
}

/// Result of one sync request, serialized as the bare operation result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SyncOutcome {
    Pull(PullResult),
    Push(PushResult),
    Resolution(ResolutionResult),
}

impl SyncOutcome {
    pub fn changes_count(&self) -> usize {
        match self {
            Self::Pull(result) => result.total_changes,
            Self::Push(result) => result.successful,
            Self::Resolution(result) => result.resolved,
        }
    }

    pub fn conflicts_count(&self) -> usize {
        match self {
            Self::Pull(result) => result.conflicts.len(),
            Self::Push(result) => result.conflicts,
            Self::Resolution(_) => 0,
        }
    }
}

/// Why one item of a batch did not land
enum ItemError {
    Rejected(String),
    Store(Error),
}

impl From<Error> for ItemError {
    fn from(error: Error) -> Self {
        Self::Store(error)
    }
}

enum ChangeOutcome {
    Applied(AppliedChange),
    Conflict(ConflictRecord),
}

pub struct SyncCoordinator<R> {
    repository: R,
    settings: CoordinatorSettings,
}

impl<R: RecordRepository> SyncCoordinator<R> {
    pub const fn new(repository: R, settings: CoordinatorSettings) -> Self {
        Self {
            repository,
            settings,
        }
    }

    pub async fn handle(&self, request: &SyncRequest, now: i64) -> Result<SyncOutcome> {
        match request.operation {
            SyncOperation::Pull => self.pull(request, now).await.map(SyncOutcome::Pull),
            SyncOperation::Push => self.push(request, now).await.map(SyncOutcome::Push),
            SyncOperation::ConflictResolution => {
                self.resolve(request, now).await.map(SyncOutcome::Resolution)
            }
        }
    }

    /// Records other devices wrote after the caller's watermark, one page at a time.
    ///
    /// A page that stops early carries a cursor naming its last record, so the
    /// next request resumes inside the same millisecond instead of repeating it.
    pub async fn pull(&self, request: &SyncRequest, now: i64) -> Result<PullResult> {
        let since = request.last_sync_timestamp;
        let cursor = request.cursor.as_ref();
        let limit = self.settings.page_size.max(1);
        let mut records = self
            .repository
            .records_since(
                &request.user_id,
                since,
                cursor,
                Some(&request.device_id),
                limit + 1,
            )
            .await?;

        let next_timestamp = records.get(limit).map(|record| record.timestamp);
        let has_more = next_timestamp.is_some();
        records.truncate(limit);

        // Step back when the page splits a millisecond or the millisecond is still open
        let settled = |timestamp: i64, split: bool| {
            if split || timestamp >= now {
                timestamp - 1
            } else {
                timestamp
            }
        };
        let watermark = match (records.last(), cursor) {
            (Some(last), _) => settled(last.timestamp, next_timestamp == Some(last.timestamp)),
            (None, Some(cursor)) => settled(cursor.timestamp, false).max(since),
            (None, None) => since,
        };

        let keys: HashSet<RecordKey> = records.iter().map(SyncRecord::key).collect();
        let conflicts: Vec<ConflictRecord> = self
            .repository
            .pending_conflicts(&request.user_id, now)
            .await?
            .into_iter()
            .filter(|conflict| {
                keys.contains(&conflict.key()) || conflict.involves_device(&request.device_id)
            })
            .collect();

        tracing::debug!(
            since,
            returned = records.len(),
            has_more,
            watermark,
            conflicts = conflicts.len(),
            "Served pull page"
        );
        Ok(PullResult::from_records(
            records, conflicts, has_more, watermark,
        ))
    }

    /// Apply each change independently; conflicts are reported, never written
    pub async fn push(&self, request: &SyncRequest, now: i64) -> Result<PushResult> {
        let mut result = PushResult {
            timestamp: now,
            ..PushResult::default()
        };

        for change in request.changes() {
            let outcome = match validate_change(change) {
                Ok(()) => self.apply_change(request, change, now).await,
                Err(message) => Err(ItemError::Rejected(message)),
            };

            match outcome {
                Ok(ChangeOutcome::Applied(applied)) => {
                    result.successful += 1;
                    result.applied.push(applied);
                }
                Ok(ChangeOutcome::Conflict(conflict)) => {
                    result.conflicts += 1;
                    result.conflict_records.push(conflict);
                }
                Err(error) => {
                    result.failed += 1;
                    result.errors.push(ChangeError {
                        change_id: change.id.clone(),
                        error: item_message(&error, &change.id),
                        retryable: matches!(error, ItemError::Store(_)),
                    });
                }
            }
        }

        tracing::debug!(
            successful = result.successful,
            failed = result.failed,
            conflicts = result.conflicts,
            "Processed push batch"
        );
        Ok(result)
    }

    pub async fn resolve(&self, request: &SyncRequest, now: i64) -> Result<ResolutionResult> {
        let mut result = ResolutionResult::default();

        for resolution in request.resolutions() {
            match self.resolve_one(&request.user_id, resolution, now).await {
                Ok(record) => {
                    result.resolved += 1;
                    result.records.push(record);
                }
                Err(error) => {
                    result.failed += 1;
                    result.errors.push(ResolutionError {
                        conflict_id: resolution.conflict_id.clone(),
                        error: item_message(&error, &resolution.conflict_id),
                    });
                }
            }
        }

        Ok(result)
    }

    async fn apply_change(
        &self,
        request: &SyncRequest,
        change: &PendingChange,
        now: i64,
    ) -> std::result::Result<ChangeOutcome, ItemError> {
        let deleted = change.is_delete();
        let data = if deleted {
            Payload::null()
        } else {
            change.data.clone()
        };
        let checksum = data.checksum();

        let stored = self
            .repository
            .get_record(&request.user_id, &change.data_type, &change.record_id)
            .await?;

        if let Some(stored) = &stored {
            if change.base_version != Some(stored.version) {
                let conflict = self.open_conflict(request, change, &data, stored, now).await?;
                return Ok(ChangeOutcome::Conflict(conflict));
            }
            if stored.checksum == checksum && stored.deleted == deleted {
                return Ok(ChangeOutcome::Applied(applied(change, stored)));
            }
        }

        let expected_version = stored.as_ref().map(|record| record.version);
        let record = SyncRecord {
            id: change.record_id.clone(),
            user_id: request.user_id.clone(),
            data_type: change.data_type.clone(),
            data: data.clone(),
            platform: request.platform,
            device_id: request.device_id.clone(),
            timestamp: now,
            version: expected_version.map_or(1, |version| version + 1),
            checksum,
            deleted,
        };

        if self.repository.write_record(&record, expected_version).await? {
            return Ok(ChangeOutcome::Applied(applied(change, &record)));
        }

        // Another writer got there first
        let current = self
            .repository
            .get_record(&request.user_id, &change.data_type, &change.record_id)
            .await?
            .ok_or_else(|| ItemError::Rejected("Record changed during write".to_string()))?;
        let conflict = self.open_conflict(request, change, &data, &current, now).await?;
        Ok(ChangeOutcome::Conflict(conflict))
    }

    async fn open_conflict(
        &self,
        request: &SyncRequest,
        change: &PendingChange,
        data: &Payload,
        stored: &SyncRecord,
        now: i64,
    ) -> Result<ConflictRecord> {
        let existing = ConflictVersion {
            version: stored.version,
            data: stored.data.clone(),
            timestamp: stored.timestamp,
            platform: stored.platform,
            device_id: stored.device_id.clone(),
        };
        let incoming = ConflictVersion {
            version: change.base_version.unwrap_or(0),
            data: data.clone(),
            timestamp: change.timestamp,
            platform: request.platform,
            device_id: request.device_id.clone(),
        };
        let analysis = conflict::analyze(&existing, &incoming);

        let record = ConflictRecord {
            id: ConflictRecord::new_id(),
            user_id: request.user_id.clone(),
            data_type: change.data_type.clone(),
            data_id: change.record_id.clone(),
            versions: vec![existing, incoming],
            severity: analysis.severity,
            suggested_strategy: analysis.suggested_strategy,
            status: ConflictStatus::Pending,
            created_at: now,
            expires_at: now.saturating_add(self.settings.conflict_ttl_ms),
            resolved_at: None,
            resolution: None,
        };
        self.repository.insert_conflict(&record).await?;

        tracing::info!(
            conflict_id = %record.id,
            data_type = %record.data_type,
            stored_version = stored.version,
            base_version = ?change.base_version,
            diff_count = analysis.diff_count,
            severity = analysis.severity.as_str(),
            strategy = analysis.suggested_strategy.as_str(),
            "Detected sync conflict"
        );
        Ok(record)
    }

    async fn resolve_one(
        &self,
        user_id: &str,
        resolution: &ConflictResolution,
        now: i64,
    ) -> std::result::Result<SyncRecord, ItemError> {
        let conflict = self
            .repository
            .get_conflict(user_id, &resolution.conflict_id)
            .await?
            .ok_or_else(|| ItemError::Rejected("Conflict not found".to_string()))?;
        if conflict.status == ConflictStatus::Resolved {
            return Err(ItemError::Rejected("Conflict already resolved".to_string()));
        }

        let data = match (&resolution.resolved_data, resolution.resolution) {
            (Some(data), _) => data.clone(),
            (None, ResolutionKind::Merge) => conflict::merge_versions(&conflict.versions),
            (None, ResolutionKind::Override) => conflict::latest_version(&conflict.versions)
                .map(|version| version.data.clone())
                .ok_or_else(|| ItemError::Rejected("Conflict has no versions".to_string()))?,
            (None, ResolutionKind::Manual) => {
                return Err(ItemError::Rejected(
                    "Manual resolution requires resolved data".to_string(),
                ));
            }
        };
        let checksum = data.checksum();

        for _ in 0..RESOLVE_WRITE_ATTEMPTS {
            let current = self
                .repository
                .get_record(user_id, &conflict.data_type, &conflict.data_id)
                .await?;
            let expected_version = current.as_ref().map(|record| record.version);
            let record = SyncRecord {
                id: conflict.data_id.clone(),
                user_id: user_id.to_string(),
                data_type: conflict.data_type.clone(),
                data: data.clone(),
                platform: Platform::Resolved,
                device_id: RESOLUTION_DEVICE_ID.to_string(),
                timestamp: now,
                version: conflict.max_version().max(expected_version.unwrap_or(0)) + 1,
                checksum: checksum.clone(),
                deleted: false,
            };

            if !self.repository.write_record(&record, expected_version).await? {
                continue;
            }

            let marked = self
                .repository
                .mark_conflict_resolved(user_id, &conflict.id, resolution.resolution, &data, now)
                .await?;
            if !marked {
                tracing::warn!(conflict_id = %conflict.id, "Conflict was resolved concurrently");
            }
            tracing::info!(
                conflict_id = %conflict.id,
                resolution = resolution.resolution.as_str(),
                version = record.version,
                stale = conflict.is_stale(now),
                "Resolved sync conflict"
            );
            return Ok(record);
        }

        Err(ItemError::Rejected(
            "Record kept changing during resolution".to_string(),
        ))
    }
}

fn validate_change(change: &PendingChange) -> std::result::Result<(), String> {
    if change.data_type.trim().is_empty() {
        return Err("Data type is required".to_string());
    }
    if change.record_id.trim().is_empty() {
        return Err("Record ID is required".to_string());
    }
    if change.id != change.key().change_id() {
        return Err("Change id does not match its record".to_string());
    }
    Ok(())
}

fn applied(change: &PendingChange, record: &SyncRecord) -> AppliedChange {
    AppliedChange {
        change_id: change.id.clone(),
        data_type: record.data_type.clone(),
        record_id: record.id.clone(),
        version: record.version,
        checksum: record.checksum.clone(),
        deleted: record.deleted,
    }
}

fn item_message(error: &ItemError, item_id: &str) -> String {
    match error {
        ItemError::Rejected(message) => message.clone(),
        ItemError::Store(error) => {
            tracing::warn!(item_id, error = %error, "Failed to store sync item");
            "Internal sync error".to_string()
        }
    }
}
