//! In-memory registry of tracked operations.
//!
//! Operations are keyed by id and kept in insertion order. The store is the
//! only writer of operation state; callers read snapshots through `get`,
//! `list_pending` and `snapshot`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use opsbridge_core::{ClockSource, Operation, OperationStatus, SystemClock};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::error::StoreError;

#[derive(Debug, Default)]
struct StoreInner {
    /// Insertion sequence -> operation. Iteration order is insertion order.
    ops: BTreeMap<u64, Operation>,
    /// Operation id -> insertion sequence.
    index: HashMap<String, u64>,
    next_seq: u64,
}

/// Registry of in-flight and completed operations.
pub struct OperationStore {
    inner: RwLock<StoreInner>,
    clock: Arc<dyn ClockSource>,
}

impl OperationStore {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            clock,
        }
    }

    /// Clock used for operation timestamps.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn ClockSource> {
        Arc::clone(&self.clock)
    }

    /// Insert a new pending operation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateOperation`] if `id` is already tracked;
    /// the existing operation is left untouched.
    pub fn track(
        &self,
        id: &str,
        operation_type: &str,
        data: Option<Value>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        if inner.index.contains_key(id) {
            return Err(StoreError::DuplicateOperation(id.to_string()));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(id.to_string(), seq);
        inner
            .ops
            .insert(seq, Operation::pending(id, operation_type, data, now));
        Ok(())
    }

    /// Move an operation to `Completed` or `Failed`, replacing its data when
    /// `data` is present. Returns the updated operation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownOperation`] for an untracked id and
    /// [`StoreError::Transition`] if the operation already finished or
    /// `status` is `Pending`.
    pub fn update(
        &self,
        id: &str,
        status: OperationStatus,
        data: Option<Value>,
    ) -> Result<Operation, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let seq = *inner
            .index
            .get(id)
            .ok_or_else(|| StoreError::UnknownOperation(id.to_string()))?;
        let op = inner
            .ops
            .get_mut(&seq)
            .ok_or_else(|| StoreError::UnknownOperation(id.to_string()))?;
        op.finish(status, data, now)?;
        Ok(op.clone())
    }

    /// Look up an operation by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Operation> {
        let inner = self.inner.read();
        inner
            .index
            .get(id)
            .and_then(|seq| inner.ops.get(seq))
            .cloned()
    }

    /// All pending operations, in insertion order.
    #[must_use]
    pub fn list_pending(&self) -> Vec<Operation> {
        self.inner
            .read()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .cloned()
            .collect()
    }

    /// Every tracked operation, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Operation> {
        self.inner.read().ops.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove terminal operations that finished more than `max_age_ms` ago.
    /// Pending operations are never evicted. Returns the number removed.
    pub fn evict_terminal_older_than(&self, max_age_ms: u64) -> usize {
        let cutoff = self.clock.now().saturating_sub(max_age_ms);
        let mut inner = self.inner.write();
        let expired: Vec<(u64, String)> = inner
            .ops
            .iter()
            .filter(|(_, op)| op.end_time.is_some_and(|end| end < cutoff))
            .map(|(seq, op)| (*seq, op.id.clone()))
            .collect();
        for (seq, id) in &expired {
            inner.ops.remove(seq);
            inner.index.remove(id);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "evicted expired operations");
        }
        expired.len()
    }
}

impl Default for OperationStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for OperationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationStore")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use opsbridge_core::{ManualClock, TransitionError};
    use serde_json::json;

    use super::*;

    fn store_at(millis: u64) -> (OperationStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(millis));
        (OperationStore::new(clock.clone()), clock)
    }

    #[test]
    fn track_then_complete() {
        let (store, clock) = store_at(1_000);
        store.track("op1", "team_create", None).unwrap();
        clock.advance(40);
        let op = store
            .update("op1", OperationStatus::Completed, Some(json!({"teamId": "T1"})))
            .unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.data, Some(json!({"teamId": "T1"})));

        let fetched = store.get("op1").unwrap();
        assert_eq!(fetched, op);
        assert_eq!(fetched.start_time, 1_000);
        assert_eq!(fetched.end_time, Some(1_040));
    }

    #[test]
    fn duplicate_track_is_rejected_and_keeps_original() {
        let (store, _) = store_at(0);
        store.track("op1", "a", Some(json!(1))).unwrap();
        let err = store.track("op1", "b", Some(json!(2))).unwrap_err();
        assert_eq!(err, StoreError::DuplicateOperation("op1".into()));
        let op = store.get("op1").unwrap();
        assert_eq!(op.operation_type, "a");
        assert_eq!(op.data, Some(json!(1)));
    }

    #[test]
    fn update_unknown_fails_loud() {
        let (store, _) = store_at(0);
        assert_eq!(
            store.update("nope", OperationStatus::Failed, None).unwrap_err(),
            StoreError::UnknownOperation("nope".into())
        );
    }

    #[test]
    fn terminal_state_is_final() {
        let (store, _) = store_at(0);
        store.track("op1", "a", None).unwrap();
        store.update("op1", OperationStatus::Failed, None).unwrap();
        let err = store
            .update("op1", OperationStatus::Completed, None)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Transition(TransitionError::AlreadyTerminal { .. })
        ));
        assert_eq!(store.get("op1").unwrap().status, OperationStatus::Failed);
    }

    #[test]
    fn list_pending_preserves_insertion_order() {
        let (store, _) = store_at(0);
        for id in ["c", "a", "b", "d"] {
            store.track(id, "t", None).unwrap();
        }
        store.update("a", OperationStatus::Completed, None).unwrap();
        let ids: Vec<String> = store.list_pending().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec!["c", "b", "d"]);
    }

    #[test]
    fn get_is_pure() {
        let (store, _) = store_at(0);
        store.track("op1", "t", None).unwrap();
        let first = store.get("op1");
        let second = store.get("op1");
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn eviction_skips_pending_and_recent() {
        let (store, clock) = store_at(0);
        store.track("old", "t", None).unwrap();
        store.track("pending", "t", None).unwrap();
        store.update("old", OperationStatus::Completed, None).unwrap();
        clock.advance(10_000);
        store.track("recent", "t", None).unwrap();
        store.update("recent", OperationStatus::Failed, None).unwrap();

        assert_eq!(store.evict_terminal_older_than(5_000), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("pending").is_some());
        assert!(store.get("recent").is_some());

        // The id is free again once evicted.
        store.track("old", "t", None).unwrap();
    }
}
