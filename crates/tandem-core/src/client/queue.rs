//! Local change queue with a retry side-queue

use std::collections::HashMap;

use crate::models::PendingChange;

/// A queued change tagged with its enqueue revision
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedChange {
    pub change: PendingChange,
    /// Monotonic per queue; a newer edit of the same key always has a higher revision
    pub revision: u64,
}

/// Pending changes keyed by change id, plus batches that failed to transmit.
///
/// Only the latest edit per key is kept pending. An acknowledgement removes
/// exactly the revisions that were sent, so edits queued while a batch was in
/// flight survive it.
#[derive(Debug, Default)]
pub struct ChangeQueue {
    pending: HashMap<String, QueuedChange>,
    retry: Vec<QueuedChange>,
    next_revision: u64,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a change, replacing any pending change for the same key
    pub fn queue(&mut self, change: PendingChange) -> u64 {
        self.next_revision += 1;
        let revision = self.next_revision;
        self.pending
            .insert(change.id.clone(), QueuedChange { change, revision });
        revision
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.retry.is_empty()
    }

    pub fn retry_len(&self) -> usize {
        self.retry.len()
    }

    pub fn contains(&self, change_id: &str) -> bool {
        self.pending.contains_key(change_id)
            || self
                .retry
                .iter()
                .any(|queued| queued.change.id == change_id)
    }

    /// Pending and retry entries, one per change id, oldest revision first.
    ///
    /// Re-editing a key moves it behind everything queued before the edit.
    pub fn snapshot(&self) -> Vec<QueuedChange> {
        let mut latest: HashMap<&str, &QueuedChange> = HashMap::new();
        for queued in self.retry.iter().chain(self.pending.values()) {
            latest
                .entry(queued.change.id.as_str())
                .and_modify(|current| {
                    if queued.revision > current.revision {
                        *current = queued;
                    }
                })
                .or_insert(queued);
        }

        let mut snapshot: Vec<QueuedChange> = latest.into_values().cloned().collect();
        snapshot.sort_by_key(|queued| queued.revision);
        snapshot
    }

    /// Drop transmitted revisions; newer edits of the same keys stay queued
    pub fn acknowledge(&mut self, batch: &[QueuedChange]) {
        for sent in batch {
            self.remove_revision(&sent.change.id, sent.revision);
        }
    }

    /// Move a failed batch into the retry queue
    pub fn defer(&mut self, batch: &[QueuedChange]) {
        for failed in batch {
            self.remove_revision(&failed.change.id, failed.revision);
            let superseded = self.pending.contains_key(&failed.change.id)
                || self.retry.iter().any(|queued| {
                    queued.change.id == failed.change.id && queued.revision >= failed.revision
                });
            if !superseded {
                self.retry.push(failed.clone());
            }
        }
    }

    /// Point queued edits of `change_id` at a freshly written server version
    pub fn rebase(&mut self, change_id: &str, version: u64) {
        if let Some(queued) = self.pending.get_mut(change_id) {
            queued.change.base_version = Some(version);
        }
        for queued in &mut self.retry {
            if queued.change.id == change_id {
                queued.change.base_version = Some(version);
            }
        }
    }

    /// Take every unsent change, newest edit per key, oldest first
    pub fn drain(&mut self) -> Vec<PendingChange> {
        let changes = self
            .snapshot()
            .into_iter()
            .map(|queued| queued.change)
            .collect();
        self.clear();
        changes
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.retry.clear();
    }

    fn remove_revision(&mut self, change_id: &str, revision: u64) {
        if self
            .pending
            .get(change_id)
            .is_some_and(|queued| queued.revision == revision)
        {
            self.pending.remove(change_id);
        }
        self.retry
            .retain(|queued| !(queued.change.id == change_id && queued.revision == revision));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::models::{ChangeOperation, Payload, RecordKey};

    fn change(record_id: &str, value: i64) -> PendingChange {
        PendingChange::new(
            &RecordKey::new("notes", record_id),
            Payload::new(json!({"value": value})),
            ChangeOperation::Update,
            None,
        )
    }

    fn ids(snapshot: &[QueuedChange]) -> Vec<String> {
        snapshot.iter().map(|q| q.change.id.clone()).collect()
    }

    #[test]
    fn newer_edit_replaces_pending_entry() {
        let mut queue = ChangeQueue::new();
        queue.queue(change("a", 1));
        queue.queue(change("a", 2));
        queue.queue(change("b", 3));

        assert_eq!(queue.len(), 2);
        let snapshot = queue.snapshot();
        assert_eq!(ids(&snapshot), vec!["notes_a", "notes_b"]);
        assert_eq!(snapshot[0].change.data.as_value(), &json!({"value": 2}));
    }

    #[test]
    fn re_edit_moves_key_behind_later_edits() {
        let mut queue = ChangeQueue::new();
        queue.queue(change("a", 1));
        queue.queue(change("b", 2));
        queue.queue(change("a", 3));

        let snapshot = queue.snapshot();
        assert_eq!(ids(&snapshot), vec!["notes_b", "notes_a"]);
        assert!(snapshot[0].revision < snapshot[1].revision);
    }

    #[test]
    fn acknowledge_keeps_edits_made_in_flight() {
        let mut queue = ChangeQueue::new();
        queue.queue(change("a", 1));
        let sent = queue.snapshot();
        queue.queue(change("a", 2));

        queue.acknowledge(&sent);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.snapshot()[0].change.data.as_value(),
            &json!({"value": 2})
        );
    }

    #[test]
    fn deferred_batch_is_retried_once_without_duplication() {
        let mut queue = ChangeQueue::new();
        queue.queue(change("a", 1));
        queue.queue(change("b", 2));
        let batch = queue.snapshot();

        queue.defer(&batch);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.retry_len(), 2);

        // Failing again must not duplicate entries
        let retry = queue.snapshot();
        queue.defer(&retry);
        assert_eq!(queue.retry_len(), 2);
        assert_eq!(queue.snapshot().len(), 2);

        queue.acknowledge(&queue.snapshot());
        assert!(queue.is_empty());
    }

    #[test]
    fn snapshot_prefers_pending_edit_over_retry_entry() {
        let mut queue = ChangeQueue::new();
        queue.queue(change("a", 1));
        let batch = queue.snapshot();
        queue.queue(change("a", 2));
        queue.defer(&batch);

        assert_eq!(queue.retry_len(), 0);
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].change.data.as_value(), &json!({"value": 2}));
    }

    #[test]
    fn rebase_updates_base_version() {
        let mut queue = ChangeQueue::new();
        queue.queue(change("a", 1));
        queue.rebase("notes_a", 4);
        assert_eq!(queue.snapshot()[0].change.base_version, Some(4));
        assert!(queue.contains("notes_a"));
        assert!(!queue.contains("notes_b"));
    }

    #[test]
    fn drain_empties_both_queues() {
        let mut queue = ChangeQueue::new();
        queue.queue(change("a", 1));
        let batch = queue.snapshot();
        queue.defer(&batch);
        queue.queue(change("b", 2));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, "notes_a");
        assert!(queue.is_empty());
    }
}
