//! One-shot completion waiters for dispatched steps.
//!
//! Each step dispatch installs a waiter bound to
//! `(workflow_id, step_id)`. The slot is atomically consumed by
//! whichever of completion, failure, timeout, or cancellation arrives
//! first; every later arrival finds nothing and becomes a no-op. A
//! retry installs a fresh waiter, so a result addressed to a superseded
//! attempt is discarded rather than cancelling the retry.

use std::collections::HashMap;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::saga::WorkflowId;

/// Result of a dispatched step attempt, as resolved by the waiter.
#[derive(Debug)]
pub enum StepOutcome {
    /// Outputs keyed by the step's declared output keys.
    Completed(HashMap<String, Value>),
    /// The participant reported a failure.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WaiterKey {
    workflow_id: WorkflowId,
    step_id: String,
}

/// Table of pending step waiters.
#[derive(Default)]
pub struct WaiterTable {
    slots: DashMap<WaiterKey, oneshot::Sender<StepOutcome>>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a waiter for a step attempt, replacing (and thereby
    /// invalidating) any slot left over from a previous attempt.
    pub fn register(&self, workflow_id: WorkflowId, step_id: &str) -> oneshot::Receiver<StepOutcome> {
        let (tx, rx) = oneshot::channel();
        let key = WaiterKey {
            workflow_id,
            step_id: step_id.to_string(),
        };
        if self.slots.insert(key, tx).is_some() {
            debug!(workflow_id = %workflow_id, step = step_id, "stale waiter replaced");
        }
        rx
    }

    /// Resolve a pending waiter. Returns false when no waiter exists
    /// (late, duplicate, or superseded result) - the outcome is
    /// discarded.
    pub fn resolve(&self, workflow_id: WorkflowId, step_id: &str, outcome: StepOutcome) -> bool {
        let key = WaiterKey {
            workflow_id,
            step_id: step_id.to_string(),
        };
        match self.slots.remove(&key) {
            Some((_, tx)) => {
                // The receiver may already be gone (timeout/cancel won
                // the race after removal); that is equally a discard.
                tx.send(outcome).is_ok()
            }
            None => {
                debug!(workflow_id = %workflow_id, step = step_id, "late step result discarded");
                false
            }
        }
    }

    /// Drop a pending waiter without resolving it (timeout or cancel
    /// consumed the attempt).
    pub fn discard(&self, workflow_id: WorkflowId, step_id: &str) {
        let key = WaiterKey {
            workflow_id,
            step_id: step_id.to_string(),
        };
        self.slots.remove(&key);
    }

    /// Number of outstanding waiters.
    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

impl std::fmt::Debug for WaiterTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaiterTable")
            .field("pending", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_resolve_delivers_outcome() {
        let table = WaiterTable::new();
        let wf = Uuid::new_v4();
        let rx = table.register(wf, "rank");

        assert!(table.resolve(wf, "rank", StepOutcome::Failed { reason: "x".into() }));
        match rx.await.unwrap() {
            StepOutcome::Failed { reason } => assert_eq!(reason, "x"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn test_late_resolution_is_discarded() {
        let table = WaiterTable::new();
        let wf = Uuid::new_v4();
        let rx = table.register(wf, "rank");
        table.discard(wf, "rank");
        drop(rx);

        assert!(!table.resolve(wf, "rank", StepOutcome::Completed(HashMap::new())));
    }

    #[tokio::test]
    async fn test_fresh_attempt_supersedes_stale_waiter() {
        let table = WaiterTable::new();
        let wf = Uuid::new_v4();

        let stale_rx = table.register(wf, "rank");
        let fresh_rx = table.register(wf, "rank");

        // The stale receiver observes channel closure, not an outcome.
        assert!(stale_rx.await.is_err());

        assert!(table.resolve(wf, "rank", StepOutcome::Completed(HashMap::new())));
        assert!(matches!(fresh_rx.await.unwrap(), StepOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_waiters_are_scoped_per_workflow() {
        let table = WaiterTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _rx_a = table.register(a, "rank");

        assert!(!table.resolve(b, "rank", StepOutcome::Completed(HashMap::new())));
        assert_eq!(table.pending(), 1);
    }
}
