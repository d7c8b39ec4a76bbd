//! Sync lifecycle events and listener dispatch

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;

use crate::models::{ConflictRecord, Payload};

/// Totals of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Records applied from the pull
    pub pulled: usize,
    /// Changes the server confirmed
    pub pushed: usize,
    /// Changes the server rejected
    pub failed: usize,
    pub conflicts: usize,
    /// Push batches attempted
    pub batches: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Watermark persisted at the end of the cycle, if it advanced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SyncStarted,
    ConflictDetected(ConflictRecord),
    DataUpdated {
        data_type: String,
        record_id: String,
        data: Payload,
        version: u64,
        deleted: bool,
    },
    SyncCompleted(SyncReport),
    SyncFailed {
        message: String,
        report: SyncReport,
    },
}

impl SyncEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SyncStarted => "sync_start",
            Self::ConflictDetected(_) => "conflict_detected",
            Self::DataUpdated { .. } => "data_updated",
            Self::SyncCompleted(_) => "sync_complete",
            Self::SyncFailed { .. } => "sync_error",
        }
    }
}

/// Handle returned by `add_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Observers {
    listeners: Vec<(ListenerId, Listener)>,
    next_id: u64,
}

impl Observers {
    pub(crate) fn add(&mut self, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push((id, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    /// Copy of the listener list so dispatch runs without the lock held
    pub(crate) fn snapshot(&self) -> Vec<Listener> {
        self.listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

/// Call every listener; a panicking listener is logged and skipped
pub(crate) fn dispatch(listeners: &[Listener], event: &SyncEvent) {
    for listener in listeners {
        let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
        if outcome.is_err() {
            tracing::error!(event = event.name(), "Sync listener panicked");
        }
    }
}
