//! Scripted transport for driver and scheduler tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::config::ClientConfig;
use super::driver::SyncDriver;
use super::store::{lock, MemoryStore};
use super::transport::{SyncTransport, TransportError, TransportResult};
use crate::models::{PendingChange, Platform};
use crate::protocol::{
    AppliedChange, DeviceIdentity, PullCursor, PullResult, PushResult, ResolutionResult,
    SyncRequest,
};

/// Pull and push responses are consumed in order; once a script runs out,
/// pulls return nothing new and pushes apply every change.
#[derive(Default)]
pub struct ScriptedTransport {
    pulls: Mutex<VecDeque<TransportResult<PullResult>>>,
    pushes: Mutex<VecDeque<Option<TransportResult<PushResult>>>>,
    resolutions: Mutex<VecDeque<TransportResult<ResolutionResult>>>,
    pushed: Mutex<Vec<Vec<PendingChange>>>,
    pull_watermarks: Mutex<Vec<i64>>,
    pull_cursors: Mutex<Vec<Option<PullCursor>>>,
    pull_gate: Option<Arc<Notify>>,
}

impl ScriptedTransport {
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            pull_gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn script_pull(&self, result: TransportResult<PullResult>) {
        lock(&self.pulls).push_back(result);
    }

    /// `None` lets the batch through, `Some` fails it
    pub fn script_push(&self, failure: Option<TransportError>) {
        lock(&self.pushes).push_back(failure.map(Err));
    }

    /// Answer the next push with exactly this response
    pub fn script_push_response(&self, response: TransportResult<PushResult>) {
        lock(&self.pushes).push_back(Some(response));
    }

    pub fn script_resolution(&self, result: TransportResult<ResolutionResult>) {
        lock(&self.resolutions).push_back(result);
    }

    pub fn pushed_batches(&self) -> Vec<Vec<PendingChange>> {
        lock(&self.pushed).clone()
    }

    pub fn pull_watermarks(&self) -> Vec<i64> {
        lock(&self.pull_watermarks).clone()
    }

    pub fn pull_cursors(&self) -> Vec<Option<PullCursor>> {
        lock(&self.pull_cursors).clone()
    }
}

impl SyncTransport for ScriptedTransport {
    async fn pull(&self, request: SyncRequest) -> TransportResult<PullResult> {
        if let Some(gate) = &self.pull_gate {
            gate.notified().await;
        }
        lock(&self.pull_watermarks).push(request.last_sync_timestamp);
        lock(&self.pull_cursors).push(request.cursor.clone());
        let scripted = lock(&self.pulls).pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PullResult {
                last_sync_timestamp: request.last_sync_timestamp,
                ..PullResult::default()
            })
        })
    }

    async fn push(&self, request: SyncRequest) -> TransportResult<PushResult> {
        let changes = request.changes().to_vec();
        lock(&self.pushed).push(changes.clone());
        let scripted = lock(&self.pushes).pop_front().flatten();
        if let Some(response) = scripted {
            return response;
        }

        let applied = changes
            .iter()
            .map(|change| AppliedChange {
                change_id: change.id.clone(),
                data_type: change.data_type.clone(),
                record_id: change.record_id.clone(),
                version: change.base_version.unwrap_or(0) + 1,
                checksum: change.data.checksum(),
                deleted: change.is_delete(),
            })
            .collect::<Vec<_>>();
        Ok(PushResult {
            successful: applied.len(),
            applied,
            timestamp: 1,
            ..PushResult::default()
        })
    }

    async fn resolve(&self, _request: SyncRequest) -> TransportResult<ResolutionResult> {
        let scripted = lock(&self.resolutions).pop_front();
        scripted.unwrap_or_else(|| Ok(ResolutionResult::default()))
    }
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity::new("user-1", "device-a", Platform::Web)
}

pub fn driver_with(
    transport: ScriptedTransport,
    configure: impl FnOnce(ClientConfig) -> ClientConfig,
) -> SyncDriver<ScriptedTransport, MemoryStore> {
    let config = configure(ClientConfig::new("http://127.0.0.1:9", identity()));
    SyncDriver::new(config, transport, MemoryStore::new())
}
