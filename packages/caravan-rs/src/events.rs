//! Topics and payload schemas for events emitted by the core.
//!
//! These are facts about saga and state lifecycle, not commands. Stage
//! request/response payloads live in [`crate::stage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::namespace::Namespace;
use crate::saga::{SlaStatus, WorkflowId};

/// Topic names used by the core.
pub mod topics {
    pub const WORKFLOW_STARTED: &str = "workflow-started";
    pub const WORKFLOW_STEP_COMPLETED: &str = "workflow-step-completed";
    pub const WORKFLOW_STEP_FAILED: &str = "workflow-step-failed";
    pub const WORKFLOW_COMPLETED: &str = "workflow-completed";
    pub const WORKFLOW_FAILED: &str = "workflow-failed";
    pub const WORKFLOW_CANCELLED: &str = "workflow-cancelled";
    pub const WORKFLOW_SLA_STATUS_CHANGED: &str = "workflow-sla-status-changed";
    pub const WORKFLOW_TIMEOUT: &str = "workflow-timeout";

    pub const STATE_CHANGED: &str = "state-changed";
    pub const STATE_STRONG_WRITE: &str = "state-strong-write";
    pub const STATE_INVALIDATE: &str = "state-invalidate";

    /// Request topic for a stage or external participant.
    pub fn stage_request(target: &str) -> String {
        format!("stage.{target}.request")
    }

    /// Paired completion topic.
    pub fn stage_completed(target: &str) -> String {
        format!("stage.{target}.completed")
    }

    /// Paired failure topic.
    pub fn stage_failed(target: &str) -> String {
        format!("stage.{target}.failed")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStarted {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub template_name: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepCompleted {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub step_id: String,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepFailed {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub step_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCompleted {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub duration_ms: u64,
    pub completed_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFailed {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub error: String,
    pub duration_ms: u64,
    pub completed_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCancelled {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaStatusChanged {
    pub workflow_id: WorkflowId,
    pub old: SlaStatus,
    pub new: SlaStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTimeout {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub max_duration_ms: u64,
    pub elapsed_ms: u64,
}

/// Operation recorded on a `state-changed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateOperation {
    Write,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChanged {
    pub namespace: Namespace,
    pub key: String,
    pub operation: StateOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Synchronous notification published before a strong-namespace write
/// returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrongWrite {
    pub namespace: Namespace,
    pub key: String,
    pub etag: String,
}

/// Incoming invalidation request; the blackboard matches `reason`
/// against its configured rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateInvalidate {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_topic_naming() {
        assert_eq!(topics::stage_request("ranking"), "stage.ranking.request");
        assert_eq!(topics::stage_completed("ranking"), "stage.ranking.completed");
        assert_eq!(topics::stage_failed("ranking"), "stage.ranking.failed");
    }

    #[test]
    fn test_state_changed_omits_absent_etag() {
        let event = StateChanged {
            namespace: Namespace::Cache,
            key: "k".into(),
            operation: StateOperation::Delete,
            etag: None,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert!(v.get("etag").is_none());
        assert_eq!(v["operation"], "delete");
    }
}
