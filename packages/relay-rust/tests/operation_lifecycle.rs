//! Operation lifecycle properties of the store.

use std::sync::Arc;

use opsbridge_core::{ManualClock, OperationStatus};
use opsbridge_relay::service::StoreError;
use opsbridge_relay::OperationStore;
use proptest::prelude::*;
use serde_json::json;

fn status() -> impl Strategy<Value = OperationStatus> {
    prop_oneof![
        Just(OperationStatus::Pending),
        Just(OperationStatus::Completed),
        Just(OperationStatus::Failed),
    ]
}

proptest! {
    /// Whatever sequence of updates arrives, the first terminal status wins
    /// and later updates are rejected without touching the operation.
    #[test]
    fn first_terminal_status_is_final(updates in prop::collection::vec(status(), 1..12)) {
        let clock = Arc::new(ManualClock::new(0));
        let store = OperationStore::new(clock.clone());
        store.track("op", "t", None).unwrap();

        let mut settled: Option<OperationStatus> = None;
        for (i, next) in updates.into_iter().enumerate() {
            clock.advance(1);
            let result = store.update("op", next, Some(json!(i)));
            match (settled, next) {
                (None, OperationStatus::Pending) | (Some(_), _) => prop_assert!(result.is_err()),
                (None, terminal) => {
                    prop_assert!(result.is_ok());
                    settled = Some(terminal);
                }
            }
            let op = store.get("op").unwrap();
            prop_assert_eq!(op.status, settled.unwrap_or(OperationStatus::Pending));
        }
    }

    #[test]
    fn tracked_ids_are_unique(ids in prop::collection::vec("[a-c]{1,2}", 1..20)) {
        let store = OperationStore::default();
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            let result = store.track(id, "t", None);
            if seen.insert(id.clone()) {
                prop_assert!(result.is_ok());
            } else {
                prop_assert_eq!(result, Err(StoreError::DuplicateOperation(id.clone())));
            }
        }
        prop_assert_eq!(store.len(), seen.len());
        prop_assert_eq!(store.list_pending().len(), seen.len());
    }
}
