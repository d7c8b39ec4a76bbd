//! Client sync driver: owns the change queue and runs pull-then-push cycles

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use super::config::ClientConfig;
use super::events::{dispatch, ListenerId, Observers, SyncEvent, SyncReport};
use super::queue::{ChangeQueue, QueuedChange};
use super::scheduler::Signal;
use super::store::{lock, KeyValueStore, LocalEntry, WATERMARK_KEY};
use super::transport::{SyncTransport, TransportError};
use crate::error::Error;
use crate::models::{
    ChangeOperation, ConflictRecord, Payload, PendingChange, RecordKey, ResolutionKind, SyncRecord,
};
use crate::protocol::{
    ConflictResolution, DeviceIdentity, PullCursor, PushResult, ResolutionResult, SyncRequest,
};
use crate::state::SyncState;
use crate::util::unix_millis_now;

const ENTRY_PREFIX: &str = "sync_";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("A sync cycle is already running")]
    AlreadySyncing,
    #[error("Device is offline")]
    Offline,
    #[error("Pull failed: {0}")]
    Pull(TransportError),
    #[error("Push failed: {0}")]
    Push(String),
    #[error("Authentication failed: {0}")]
    Unauthorized(String),
    #[error("Conflict resolution failed: {0}")]
    Resolve(String),
    #[error(transparent)]
    Storage(#[from] Error),
}

impl SyncError {
    /// The trigger was refused without doing any I/O
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::AlreadySyncing | Self::Offline)
    }

    /// A later cycle may succeed without user action
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::AlreadySyncing | Self::Offline | Self::Push(_) => true,
            Self::Pull(error) => error.is_transient(),
            Self::Unauthorized(_) | Self::Resolve(_) | Self::Storage(_) => false,
        }
    }
}

/// Point-in-time view of the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_timestamp: i64,
    pub pending_changes: usize,
    pub retry_queue_size: usize,
    pub state: SyncState,
}

/// Events held back until the network phases of a cycle are over
#[derive(Default)]
struct CycleEvents {
    conflicts: Vec<ConflictRecord>,
    seen_conflicts: HashSet<String>,
    updates: Vec<SyncEvent>,
}

impl CycleEvents {
    fn conflict(&mut self, conflict: ConflictRecord) {
        if self.seen_conflicts.insert(conflict.id.clone()) {
            self.conflicts.push(conflict);
        }
    }
}

/// Clears the syncing flag when a cycle ends, however it ends
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner<T, S> {
    config: ClientConfig,
    transport: T,
    store: S,
    queue: Mutex<ChangeQueue>,
    observers: Mutex<Observers>,
    syncing: AtomicBool,
    online: AtomicBool,
    last_cycle_failed: AtomicBool,
    signals: Mutex<Option<mpsc::UnboundedSender<Signal>>>,
}

/// Sync driver for one account on one device.
///
/// Clones share the same queue, store and listeners.
pub struct SyncDriver<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for SyncDriver<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SyncTransport, S: KeyValueStore> SyncDriver<T, S> {
    pub fn new(config: ClientConfig, transport: T, store: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                store,
                queue: Mutex::new(ChangeQueue::new()),
                observers: Mutex::new(Observers::default()),
                syncing: AtomicBool::new(false),
                online: AtomicBool::new(true),
                last_cycle_failed: AtomicBool::new(false),
                signals: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.config.identity
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Queue a local edit, based on the last server version cached for the record
    pub fn queue_change(
        &self,
        data_type: &str,
        record_id: &str,
        data: Payload,
        operation: ChangeOperation,
    ) -> Result<PendingChange, SyncError> {
        let key = record_key(data_type, record_id)?;
        let base_version = self.cached_entry(&key)?.and_then(|entry| entry.version);
        self.enqueue(&key, data, operation, base_version)
    }

    /// Queue a local edit against an explicit base version
    pub fn queue_change_with_base(
        &self,
        data_type: &str,
        record_id: &str,
        data: Payload,
        operation: ChangeOperation,
        base_version: Option<u64>,
    ) -> Result<PendingChange, SyncError> {
        let key = record_key(data_type, record_id)?;
        self.enqueue(&key, data, operation, base_version)
    }

    fn enqueue(
        &self,
        key: &RecordKey,
        data: Payload,
        operation: ChangeOperation,
        base_version: Option<u64>,
    ) -> Result<PendingChange, SyncError> {
        let change = PendingChange::new(key, data, operation, base_version);
        let cached_version = self.cached_entry(key)?.and_then(|entry| entry.version);
        let entry = LocalEntry {
            data: change.data.clone(),
            timestamp: change.timestamp,
            synced: false,
            version: cached_version,
            deleted: change.is_delete(),
        };
        self.inner.store.set_as(&key.storage_key(), &entry)?;
        lock(&self.inner.queue).queue(change.clone());

        tracing::debug!(
            change_id = %change.id,
            operation = change.operation.as_str(),
            base_version = ?change.base_version,
            "Queued local change"
        );
        self.signal(Signal::ChangeQueued);
        Ok(change)
    }

    /// Run one pull-then-push cycle now
    pub async fn trigger_sync(&self) -> Result<SyncReport, SyncError> {
        self.run_cycle(false).await
    }

    /// Forget the watermark and pull everything again
    pub async fn force_full_sync(&self) -> Result<SyncReport, SyncError> {
        self.run_cycle(true).await
    }

    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        let (pending_changes, retry_queue_size) = {
            let queue = lock(&self.inner.queue);
            (queue.len(), queue.retry_len())
        };
        let is_online = self.is_online();
        let is_syncing = self.inner.syncing.load(Ordering::Acquire);
        let last_cycle_failed = self.inner.last_cycle_failed.load(Ordering::Acquire);

        Ok(SyncStatus {
            is_online,
            is_syncing,
            last_sync_timestamp: self.last_sync_timestamp()?,
            pending_changes,
            retry_queue_size,
            state: SyncState::derive(is_online, is_syncing, last_cycle_failed),
        })
    }

    /// Cached copy of a record; deleted records read as absent
    pub fn get_local_data(
        &self,
        data_type: &str,
        record_id: &str,
    ) -> Result<Option<LocalEntry>, SyncError> {
        let key = record_key(data_type, record_id)?;
        Ok(self.cached_entry(&key)?.filter(|entry| !entry.deleted))
    }

    /// Drop every cached record, the watermark and all queued changes
    pub fn clear_local_data(&self) -> Result<(), SyncError> {
        for key in self.inner.store.keys()? {
            if key.starts_with(ENTRY_PREFIX) || key == WATERMARK_KEY {
                self.inner.store.remove(&key)?;
            }
        }
        lock(&self.inner.queue).clear();
        self.inner.last_cycle_failed.store(false, Ordering::Release);
        tracing::info!("Cleared local sync data");
        Ok(())
    }

    /// Send one resolution and apply the records the server wrote
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ResolutionKind,
        resolved_data: Option<Payload>,
    ) -> Result<ResolutionResult, SyncError> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }

        let request = SyncRequest::resolve(
            self.identity(),
            vec![ConflictResolution {
                conflict_id: conflict_id.to_string(),
                resolution,
                resolved_data,
                timestamp: unix_millis_now(),
            }],
        );
        let result = self
            .inner
            .transport
            .resolve(request)
            .await
            .map_err(|error| {
                if error.is_auth() {
                    SyncError::Unauthorized(error.to_string())
                } else {
                    SyncError::Resolve(error.to_string())
                }
            })?;

        if result.resolved == 0 && !result.errors.is_empty() {
            let message = result
                .errors
                .iter()
                .map(|error| format!("{}: {}", error.conflict_id, error.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(SyncError::Resolve(message));
        }

        let mut updates = Vec::new();
        for record in &result.records {
            if let Some(event) = self.apply_remote(record)? {
                updates.push(event);
            }
        }
        let listeners = lock(&self.inner.observers).snapshot();
        for event in &updates {
            dispatch(&listeners, event);
        }

        tracing::info!(
            conflict_id,
            resolution = resolution.as_str(),
            records = result.records.len(),
            "Resolved sync conflict"
        );
        Ok(result)
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Update reachability; going online wakes the scheduler
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::AcqRel);
        if online && !was_online {
            tracing::info!("Connectivity restored");
            self.signal(Signal::CameOnline);
        } else if !online && was_online {
            tracing::info!("Connectivity lost");
        }
    }

    pub fn add_listener(
        &self,
        listener: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        lock(&self.inner.observers).add(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        lock(&self.inner.observers).remove(id)
    }

    /// Changes not yet confirmed by the server, newest edit per key
    pub fn unsent_changes(&self) -> Vec<PendingChange> {
        lock(&self.inner.queue)
            .snapshot()
            .into_iter()
            .map(|queued| queued.change)
            .collect()
    }

    /// Put previously unsent changes back on the queue as they were
    pub fn requeue(&self, changes: Vec<PendingChange>) {
        let mut queue = lock(&self.inner.queue);
        for change in changes {
            queue.queue(change);
        }
    }

    pub(crate) fn signal(&self, signal: Signal) {
        if let Some(sender) = lock(&self.inner.signals).as_ref() {
            sender.send(signal).ok();
        }
    }

    pub(crate) fn install_signals(&self, sender: Option<mpsc::UnboundedSender<Signal>>) {
        *lock(&self.inner.signals) = sender;
    }

    fn last_sync_timestamp(&self) -> Result<i64, Error> {
        Ok(self.inner.store.get_as::<i64>(WATERMARK_KEY)?.unwrap_or(0))
    }

    fn cached_entry(&self, key: &RecordKey) -> Result<Option<LocalEntry>, Error> {
        self.inner.store.get_as(&key.storage_key())
    }

    fn emit(&self, event: &SyncEvent) {
        let listeners = lock(&self.inner.observers).snapshot();
        dispatch(&listeners, event);
    }

    async fn run_cycle(&self, full: bool) -> Result<SyncReport, SyncError> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        let _guard = CycleGuard::acquire(&self.inner.syncing).ok_or(SyncError::AlreadySyncing)?;

        self.emit(&SyncEvent::SyncStarted);
        let started = std::time::Instant::now();
        let mut report = SyncReport::default();
        let mut events = CycleEvents::default();

        let outcome = self.exchange(full, &mut report, &mut events).await;

        let listeners = lock(&self.inner.observers).snapshot();
        for conflict in events.conflicts {
            dispatch(&listeners, &SyncEvent::ConflictDetected(conflict));
        }
        for update in &events.updates {
            dispatch(&listeners, update);
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match outcome {
            Ok(watermark) => {
                report.watermark = Some(watermark);
                self.inner.last_cycle_failed.store(false, Ordering::Release);
                tracing::info!(
                    pulled = report.pulled,
                    pushed = report.pushed,
                    failed = report.failed,
                    conflicts = report.conflicts,
                    watermark,
                    elapsed_ms,
                    "Sync cycle completed"
                );
                dispatch(&listeners, &SyncEvent::SyncCompleted(report.clone()));
                Ok(report)
            }
            Err(error) => {
                self.inner.last_cycle_failed.store(true, Ordering::Release);
                tracing::warn!(%error, elapsed_ms, "Sync cycle failed");
                dispatch(
                    &listeners,
                    &SyncEvent::SyncFailed {
                        message: error.to_string(),
                        report,
                    },
                );
                Err(error)
            }
        }
    }

    /// Pull, then push. Returns the watermark once it has been persisted.
    async fn exchange(
        &self,
        full: bool,
        report: &mut SyncReport,
        events: &mut CycleEvents,
    ) -> Result<i64, SyncError> {
        let since = if full { 0 } else { self.last_sync_timestamp()? };
        let watermark = self.pull_pages(since, report, events).await?;

        if let Some(failure) = self.push_pending(since, report, events).await? {
            return Err(SyncError::Push(failure));
        }

        self.inner.store.set_as(WATERMARK_KEY, &watermark)?;
        Ok(watermark)
    }

    /// Follow pull pages from `since`. Pages are chained by the server's cursor;
    /// only the final page's watermark is returned.
    async fn pull_pages(
        &self,
        since: i64,
        report: &mut SyncReport,
        events: &mut CycleEvents,
    ) -> Result<i64, SyncError> {
        let mut from = since;
        let mut cursor: Option<PullCursor> = None;
        let mut watermark = since;
        for page in 1..=self.inner.config.max_pull_pages {
            let request = SyncRequest::pull(self.identity(), from).with_cursor(cursor.take());
            let result = self
                .inner
                .transport
                .pull(request)
                .await
                .map_err(|error| {
                    if error.is_auth() {
                        SyncError::Unauthorized(error.to_string())
                    } else {
                        SyncError::Pull(error)
                    }
                })?;

            let has_more = result.has_more;
            let next_cursor = result.next_cursor.clone();
            watermark = result.last_sync_timestamp.max(since);
            for conflict in &result.conflicts {
                events.conflict(conflict.clone());
            }
            for record in result.into_records() {
                if let Some(event) = self.apply_remote(&record)? {
                    report.pulled += 1;
                    events.updates.push(event);
                }
            }

            if !has_more {
                return Ok(watermark);
            }
            match next_cursor {
                Some(next) => cursor = Some(next),
                // Servers without cursors page by watermark alone
                None if watermark > from => from = watermark,
                None => {
                    tracing::warn!(page, from, "Pull watermark did not advance; stopping paging");
                    return Ok(from);
                }
            }
        }

        tracing::debug!(
            pages = self.inner.config.max_pull_pages,
            "Pull page limit reached; continuing next cycle"
        );
        Ok(watermark)
    }

    /// Apply one server record to the local cache
    fn apply_remote(&self, record: &SyncRecord) -> Result<Option<SyncEvent>, Error> {
        let key = record.key();
        if !record.verify_checksum() {
            tracing::warn!(
                record = %key,
                version = record.version,
                "Skipping record with checksum mismatch"
            );
            return Ok(None);
        }

        if lock(&self.inner.queue).contains(&key.change_id()) {
            tracing::debug!(record = %key, "Local edit pending; leaving cached copy");
            return Ok(None);
        }

        let storage_key = key.storage_key();
        let cached = self.cached_entry(&key)?;
        if cached
            .as_ref()
            .is_some_and(|entry| entry.synced && entry.version.is_some_and(|v| v >= record.version))
        {
            return Ok(None);
        }

        if record.deleted {
            self.inner.store.remove(&storage_key)?;
        } else {
            self.inner.store.set_as(
                &storage_key,
                &LocalEntry {
                    data: record.data.clone(),
                    timestamp: record.timestamp,
                    synced: true,
                    version: Some(record.version),
                    deleted: false,
                },
            )?;
        }

        Ok(Some(SyncEvent::DataUpdated {
            data_type: record.data_type.clone(),
            record_id: record.id.clone(),
            data: record.data.clone(),
            version: record.version,
            deleted: record.deleted,
        }))
    }

    /// Push queued changes in batches. Returns a summary when any batch failed.
    async fn push_pending(
        &self,
        since: i64,
        report: &mut SyncReport,
        events: &mut CycleEvents,
    ) -> Result<Option<String>, SyncError> {
        let snapshot = lock(&self.inner.queue).snapshot();
        if snapshot.is_empty() {
            return Ok(None);
        }

        let batch_size = self.inner.config.batch_size.max(1);
        let total = snapshot.len().div_ceil(batch_size);
        let mut failures = Vec::new();

        for (index, batch) in snapshot.chunks(batch_size).enumerate() {
            report.batches += 1;
            let changes = batch.iter().map(|queued| queued.change.clone()).collect();
            let request = SyncRequest::push(self.identity(), since, changes);

            match self.inner.transport.push(request).await {
                Ok(result) => {
                    if let Some(failure) = self.apply_push_result(batch, result, report, events)? {
                        failures.push(failure);
                    }
                }
                Err(error) if error.is_auth() => {
                    return Err(SyncError::Unauthorized(error.to_string()));
                }
                Err(error) => {
                    tracing::warn!(
                        batch = index + 1,
                        total,
                        size = batch.len(),
                        %error,
                        "Push batch failed; moved to retry queue"
                    );
                    lock(&self.inner.queue).defer(batch);
                    report.errors.push(error.to_string());
                    failures.push(error.to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!(
                "{} of {total} batches incomplete: {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    /// Settle one batch from the server's per-item answer.
    ///
    /// Applied changes leave the queue. Conflicting changes leave it too: the
    /// conflict record holds the losing write until someone resolves it.
    /// Rejected changes are dropped. Changes the server could not store, or
    /// left out of its answer, move to the retry queue and are summarized in
    /// the returned message.
    fn apply_push_result(
        &self,
        batch: &[QueuedChange],
        result: PushResult,
        report: &mut SyncReport,
        events: &mut CycleEvents,
    ) -> Result<Option<String>, Error> {
        let mut settled: HashSet<String> = result
            .applied
            .iter()
            .map(|applied| applied.change_id.clone())
            .collect();
        settled.extend(
            result
                .conflict_records
                .iter()
                .map(|conflict| conflict.key().change_id()),
        );
        let mut retryable = HashSet::new();
        for error in &result.errors {
            if error.retryable {
                retryable.insert(error.change_id.clone());
            } else {
                settled.insert(error.change_id.clone());
            }
        }

        let (done, deferred): (Vec<QueuedChange>, Vec<QueuedChange>) =
            batch.iter().cloned().partition(|queued| {
                settled.contains(&queued.change.id) && !retryable.contains(&queued.change.id)
            });
        {
            let mut queue = lock(&self.inner.queue);
            queue.acknowledge(&done);
            queue.defer(&deferred);
        }

        report.pushed += result.successful;
        report.failed += result.failed;
        report.conflicts += result.conflicts;
        for error in result.errors {
            if error.retryable {
                tracing::warn!(change_id = %error.change_id, error = %error.error, "Change not stored; moved to retry queue");
            } else {
                tracing::warn!(change_id = %error.change_id, error = %error.error, "Change rejected");
            }
            report
                .errors
                .push(format!("{}: {}", error.change_id, error.error));
        }

        for applied in result.applied {
            let key = RecordKey::new(&applied.data_type, &applied.record_id);
            let still_pending = {
                let mut queue = lock(&self.inner.queue);
                queue.rebase(&applied.change_id, applied.version);
                queue.contains(&applied.change_id)
            };

            let storage_key = key.storage_key();
            if applied.deleted && !still_pending {
                self.inner.store.remove(&storage_key)?;
            } else if let Some(mut entry) = self.cached_entry(&key)? {
                entry.version = Some(applied.version);
                entry.synced = !still_pending;
                self.inner.store.set_as(&storage_key, &entry)?;
            }
        }

        for conflict in result.conflict_records {
            events.conflict(conflict);
        }

        if deferred.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!(
                "{} of {} changes not stored",
                deferred.len(),
                batch.len()
            )))
        }
    }
}

fn record_key(data_type: &str, record_id: &str) -> Result<RecordKey, Error> {
    let data_type = data_type.trim();
    let record_id = record_id.trim();
    if data_type.is_empty() || record_id.is_empty() {
        return Err(Error::InvalidInput(
            "data type and record id are required".to_string(),
        ));
    }
    Ok(RecordKey::new(data_type, record_id))
}
