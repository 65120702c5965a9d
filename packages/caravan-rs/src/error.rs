//! Structured error types for the orchestration runtime.
//!
//! `EngineError` is the pattern-matchable error surface returned to
//! callers. Internals use `anyhow::Error` as transport inside stage
//! handlers and subscribers; nothing `anyhow`-shaped ever crosses the
//! bus - failures crossing the bus travel as structured failure
//! payloads (see `stage::StageFailure`).
//!
//! Propagation policy: stage failures are recovered locally by the retry
//! loop and then by the template's error-handling strategy; only
//! saga-terminal failures surface via `workflow-failed`. Blackboard
//! failures surface to the immediate caller. Bus subscriber errors are
//! absorbed and logged.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result alias for engine and blackboard operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the workflow engine and blackboard.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller named a template that was never registered.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    /// Another non-terminal saga already holds this saga id.
    #[error("saga {saga_id} is already running as workflow {workflow_id}")]
    SagaConflict { saga_id: String, workflow_id: Uuid },

    /// Caller named a namespace outside the declared enumeration.
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    /// A required input or piece of request data is absent.
    #[error("missing required data: {0}")]
    MissingData(String),

    /// No workflow with this id exists (it may have been reaped).
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// A step exceeded its budget, or the saga exceeded its SLA.
    #[error("step {step} timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    /// A step failed more times than its retry budget allows.
    #[error("step {step} failed after {attempts} attempts: {reason}")]
    RetryExhausted {
        step: String,
        attempts: u32,
        reason: String,
    },

    /// A compensation action itself failed.
    #[error("compensation {action} for step {step} failed: {reason}")]
    CompensationFailure {
        step: String,
        action: String,
        reason: String,
    },

    /// The concurrent-saga cap was reached at admission.
    #[error("concurrent workflow limit reached ({limit})")]
    CapacityExceeded { limit: usize },

    /// A template invariant (DAG, dependency naming, input wiring) is
    /// broken. Fatal: templates are validated at registration.
    #[error("template invariant violated: {0}")]
    DependencyViolation(String),

    /// A stage reported a failure; carries the stage's message unchanged.
    #[error("stage {stage} reported failure: {message}")]
    StagePropagated { stage: String, message: String },
}

impl EngineError {
    /// True for errors reported to the caller at admission time
    /// (invalid input rather than runtime failure).
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownTemplate(_)
                | EngineError::SagaConflict { .. }
                | EngineError::UnknownNamespace(_)
                | EngineError::MissingData(_)
        )
    }
}
