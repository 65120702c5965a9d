//! Saga state: one running instance of a workflow template.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of one workflow execution. Distinct from the
/// caller-supplied saga id: a fallback switch starts a new workflow for
/// the same saga.
pub type WorkflowId = Uuid;

/// Lifecycle status of a saga. Terminal statuses never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SagaStatus::Running)
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Coarse SLA classification of a running saga's elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaStatus {
    Ok,
    Warning,
    Critical,
    Exceeded,
}

impl fmt::Display for SlaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlaStatus::Ok => "ok",
            SlaStatus::Warning => "warning",
            SlaStatus::Critical => "critical",
            SlaStatus::Exceeded => "exceeded",
        };
        write!(f, "{s}")
    }
}

/// One recorded step failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub step: String,
    pub message: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Mutable state of a running saga.
///
/// Mutated only by the engine's per-saga driver task; everyone else
/// observes it through [`SagaSnapshot`].
#[derive(Debug)]
pub struct Saga {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub template_name: String,
    status: SagaStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub failed_steps: HashSet<String>,
    /// Per-step retry counters; reset to zero on success.
    pub retry_counts: HashMap<String, u32>,
    /// Output key -> payload, accumulated across completed steps.
    pub step_results: HashMap<String, Value>,
    /// Append-only failure log.
    pub errors: Vec<StepError>,
    pub sla_status: SlaStatus,
    /// Opaque data carried from the originating request.
    pub data: Value,
}

impl Saga {
    pub fn new(
        workflow_id: WorkflowId,
        saga_id: impl Into<String>,
        template_name: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            workflow_id,
            saga_id: saga_id.into(),
            template_name: template_name.into(),
            status: SagaStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            current_step: None,
            completed_steps: Vec::new(),
            failed_steps: HashSet::new(),
            retry_counts: HashMap::new(),
            step_results: HashMap::new(),
            errors: Vec::new(),
            sla_status: SlaStatus::Ok,
            data,
        }
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// Transition the status, refusing to leave a terminal state.
    ///
    /// Returns whether the transition was applied. A terminal transition
    /// also stamps `end_time`.
    pub fn try_set_status(&mut self, next: SagaStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
            self.current_step = None;
        }
        true
    }

    pub fn retry_count(&self, step_id: &str) -> u32 {
        self.retry_counts.get(step_id).copied().unwrap_or(0)
    }

    /// Record a successful step: append to the completion order, store
    /// outputs, reset the retry counter.
    pub fn record_step_success(&mut self, step_id: &str, outputs: HashMap<String, Value>) {
        self.completed_steps.push(step_id.to_string());
        self.step_results.extend(outputs);
        self.retry_counts.insert(step_id.to_string(), 0);
    }

    pub fn record_step_error(&mut self, step_id: &str, message: impl Into<String>) {
        self.errors.push(StepError {
            step: step_id.to_string(),
            message: message.into(),
            retry_count: self.retry_count(step_id),
            timestamp: Utc::now(),
        });
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }

    pub fn snapshot(&self) -> SagaSnapshot {
        SagaSnapshot {
            workflow_id: self.workflow_id,
            saga_id: self.saga_id.clone(),
            template_name: self.template_name.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            current_step: self.current_step.clone(),
            completed_steps: self.completed_steps.clone(),
            failed_steps: self.failed_steps.iter().cloned().collect(),
            step_results: self.step_results.clone(),
            errors: self.errors.clone(),
            sla_status: self.sla_status,
            data: self.data.clone(),
        }
    }
}

/// Read-only view of a saga, returned by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaSnapshot {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub template_name: String,
    pub status: SagaStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub step_results: HashMap<String, Value>,
    pub errors: Vec<StepError>,
    pub sla_status: SlaStatus,
    pub data: Value,
}
