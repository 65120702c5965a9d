//! The workflow engine: drives sagas through their templates.
//!
//! One saga per traveler request. The engine serializes step
//! transitions within a saga (at most one step is current at a time)
//! while sagas run independently and in parallel. The execution loop is
//! entirely event-driven: it suspends only awaiting a step
//! completion/failure, a retry backoff, or a cancellation signal.
//!
//! ```text
//! start() ──► admit ──► drive task ──► select next ready step
//!                            │                │
//!                            │         system │ stage/external
//!                            │      handler   │ request envelope + waiter
//!                            │                ▼
//!                            │         outcome | timeout | cancel
//!                            │                │
//!                            └── retry w/ backoff, else strategy:
//!                                fail-fast | compensate | retry-and-fallback
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blackboard::Blackboard;
use crate::bus::EventBus;
use crate::config::{BlackboardConfig, EngineConfig};
use crate::envelope::{CorrelationId, Envelope};
use crate::error::{EngineError, EngineResult};
use crate::events::{
    topics, SlaStatusChanged, WorkflowCancelled, WorkflowCompleted, WorkflowFailed,
    WorkflowStarted, WorkflowStepCompleted, WorkflowStepFailed, WorkflowTimeout,
};
use crate::saga::{Saga, SagaSnapshot, SagaStatus, SlaStatus, WorkflowId};
use crate::stage::{StageCompletion, StageFailure, StageRequest};
use crate::template::{CompensationAction, ErrorStrategy, Step, StepKind, Template};
use crate::waiter::{StepOutcome, WaiterTable};

/// Context handed to a system step handler.
#[derive(Clone)]
pub struct StepContext {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub step_id: String,
    /// Opaque step configuration from the template.
    pub config: Value,
    /// Inputs resolved from earlier steps' results.
    pub inputs: HashMap<String, Value>,
    /// Opaque data carried from the originating request.
    pub data: Value,
    pub blackboard: Blackboard,
    pub bus: EventBus,
}

/// In-process handler for `system` steps, registered by target name.
#[async_trait::async_trait]
pub trait SystemHandler: Send + Sync + 'static {
    async fn run(&self, ctx: StepContext) -> Result<HashMap<String, Value>>;
}

/// Context handed to a compensation handler.
#[derive(Clone)]
pub struct CompensationContext {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    /// The step being compensated.
    pub failed_step: String,
    /// The action name this handler was registered under.
    pub action: String,
    /// The failure reason that triggered the compensation.
    pub failure_reason: String,
    /// Snapshot of all step results accumulated so far.
    pub step_results: HashMap<String, Value>,
    pub data: Value,
    pub blackboard: Blackboard,
    pub bus: EventBus,
}

/// Corrective action executed in place of (or before failing on) a
/// permanently failed step, registered by action name.
#[async_trait::async_trait]
pub trait CompensationHandler: Send + Sync + 'static {
    async fn compensate(&self, ctx: CompensationContext) -> Result<HashMap<String, Value>>;
}

/// Options for `start()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Correlation carried on every envelope this saga publishes.
    /// Defaults to a fresh id.
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Default)]
struct EngineCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Snapshot of engine lifecycle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub active: usize,
}

/// Why a saga's driver was interrupted.
#[derive(Debug, Clone)]
pub(crate) enum CancelCause {
    Requested { reason: String },
    SlaExceeded { elapsed_ms: u64 },
}

/// Shared state for one running (or recently terminal) saga.
pub(crate) struct SagaHandle {
    pub(crate) saga: Mutex<Saga>,
    pub(crate) template: Arc<Template>,
    pub(crate) cancel: CancellationToken,
    pub(crate) cancel_cause: Mutex<Option<CancelCause>>,
    correlation_id: CorrelationId,
}

impl SagaHandle {
    pub(crate) fn with_saga<T>(&self, f: impl FnOnce(&mut Saga) -> T) -> T {
        let mut guard = self.saga.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.with_saga(|saga| saga.status().is_terminal())
    }

    fn set_cancel_cause(&self, cause: CancelCause) {
        let mut guard = self
            .cancel_cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(cause);
        }
    }

    fn take_cancel_cause(&self) -> Option<CancelCause> {
        self.cancel_cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) bus: EventBus,
    blackboard: Blackboard,
    templates: HashMap<String, Arc<Template>>,
    system_handlers: HashMap<String, Arc<dyn SystemHandler>>,
    compensation_handlers: HashMap<String, Arc<dyn CompensationHandler>>,
    pub(crate) sagas: dashmap::DashMap<WorkflowId, Arc<SagaHandle>>,
    saga_index: dashmap::DashMap<String, WorkflowId>,
    waiters: WaiterTable,
    routed_targets: dashmap::DashMap<String, ()>,
    running: AtomicUsize,
    counters: EngineCounters,
    pub(crate) supervisor_shutdown: CancellationToken,
}

/// The workflow engine. Clones share the same runtime.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Admit a new saga and start driving it.
    ///
    /// Fails with `CapacityExceeded` when the concurrent cap is
    /// reached, `UnknownTemplate` for an unregistered template, and
    /// `SagaConflict` when a non-terminal saga already holds this id.
    pub fn start(
        &self,
        template_name: &str,
        saga_id: impl Into<String>,
        data: Value,
        options: StartOptions,
    ) -> EngineResult<WorkflowId> {
        let correlation_id = options.correlation_id.unwrap_or_default();
        self.inner
            .start_internal(template_name, saga_id.into(), data, correlation_id)
    }

    /// Cancel a workflow. Idempotent: cancelling a terminal workflow is
    /// a no-op. Late-arriving step results are discarded.
    pub fn cancel(&self, workflow_id: WorkflowId, reason: impl Into<String>) -> EngineResult<()> {
        let handle = self
            .inner
            .sagas
            .get(&workflow_id)
            .map(|entry| entry.clone())
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        if handle.is_terminal() {
            return Ok(());
        }
        handle.set_cancel_cause(CancelCause::Requested { reason: reason.into() });
        handle.cancel.cancel();
        Ok(())
    }

    /// Snapshot of a workflow's state.
    pub fn status(&self, workflow_id: WorkflowId) -> EngineResult<SagaSnapshot> {
        self.inner
            .sagas
            .get(&workflow_id)
            .map(|handle| handle.with_saga(|saga| saga.snapshot()))
            .ok_or(EngineError::WorkflowNotFound(workflow_id))
    }

    /// Number of sagas currently running.
    pub fn active_count(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Names of the registered templates.
    pub fn template_names(&self) -> Vec<String> {
        self.inner.templates.keys().cloned().collect()
    }

    pub fn metrics(&self) -> EngineMetrics {
        let c = &self.inner.counters;
        EngineMetrics {
            started: c.started.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            active: self.active_count(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.inner.blackboard
    }

    /// Stop the SLA/cleanup supervisor. Running sagas keep driving to
    /// their terminal states.
    pub fn shutdown(&self) {
        self.inner.supervisor_shutdown.cancel();
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("templates", &self.inner.templates.len())
            .field("active", &self.active_count())
            .finish()
    }
}

/// How a step attempt ended.
enum Attempt {
    Completed(HashMap<String, Value>),
    Failed(String),
    Interrupted,
}

/// How a step ended after its retry budget.
enum StepResolution {
    Completed(HashMap<String, Value>),
    Failed { reason: String },
    Interrupted,
}

/// Whether a failure strategy let the saga resume.
enum Disposition {
    Resumed,
    Terminal,
}

impl EngineInner {
    fn start_internal(
        self: &Arc<Self>,
        template_name: &str,
        saga_id: String,
        data: Value,
        correlation_id: CorrelationId,
    ) -> EngineResult<WorkflowId> {
        let template = self
            .templates
            .get(template_name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTemplate(template_name.to_string()))?;

        // Reserve a running slot before touching any other state, so a
        // refused admission has no side effects.
        let limit = self.config.max_concurrent_workflows;
        if self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_err()
        {
            return Err(EngineError::CapacityExceeded { limit });
        }

        let workflow_id = uuid::Uuid::new_v4();

        // One non-terminal saga per saga id.
        match self.saga_index.entry(saga_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let existing = *occupied.get();
                let conflict = self
                    .sagas
                    .get(&existing)
                    .map(|handle| !handle.is_terminal())
                    .unwrap_or(false);
                if conflict {
                    self.running.fetch_sub(1, Ordering::AcqRel);
                    return Err(EngineError::SagaConflict {
                        saga_id,
                        workflow_id: existing,
                    });
                }
                occupied.insert(workflow_id);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(workflow_id);
            }
        }

        let handle = Arc::new(SagaHandle {
            saga: Mutex::new(Saga::new(workflow_id, saga_id.clone(), template_name, data)),
            template,
            cancel: CancellationToken::new(),
            cancel_cause: Mutex::new(None),
            correlation_id,
        });
        self.sagas.insert(workflow_id, handle.clone());
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        info!(workflow_id = %workflow_id, saga_id = %saga_id, template = template_name, "workflow admitted");

        let inner = self.clone();
        tokio::spawn(async move {
            inner.drive(handle).await;
        });

        Ok(workflow_id)
    }

    /// The per-saga driver. Sole mutator of the saga's state.
    async fn drive(self: Arc<Self>, handle: Arc<SagaHandle>) {
        let (workflow_id, saga_id, start_time) = handle.with_saga(|saga| {
            (saga.workflow_id, saga.saga_id.clone(), saga.start_time)
        });

        self.publish(
            topics::WORKFLOW_STARTED,
            &saga_id,
            &handle,
            &WorkflowStarted {
                workflow_id,
                saga_id: saga_id.clone(),
                template_name: handle.template.name.clone(),
                start_time,
            },
        );

        loop {
            if handle.cancel.is_cancelled() {
                self.finish_interrupted(&handle);
                return;
            }

            let next = handle.with_saga(|saga| select_next_step(&handle.template, saga));
            let Some(step) = next else {
                self.finish_completed(&handle);
                return;
            };

            handle.with_saga(|saga| saga.current_step = Some(step.id.clone()));
            debug!(workflow_id = %workflow_id, step = %step.id, "step selected");

            match self.run_step(&handle, &step).await {
                StepResolution::Completed(outputs) => {
                    self.complete_step(&handle, &step, outputs);
                }
                StepResolution::Interrupted => {
                    self.finish_interrupted(&handle);
                    return;
                }
                StepResolution::Failed { reason } => {
                    handle.with_saga(|saga| {
                        saga.failed_steps.insert(step.id.clone());
                    });
                    match self.handle_permanent_failure(&handle, &step, &reason).await {
                        Disposition::Resumed => continue,
                        Disposition::Terminal => return,
                    }
                }
            }
        }
    }

    /// Run one step through its retry budget.
    async fn run_step(self: &Arc<Self>, handle: &Arc<SagaHandle>, step: &Step) -> StepResolution {
        loop {
            match self.attempt_step(handle, step).await {
                Attempt::Completed(outputs) => return StepResolution::Completed(outputs),
                Attempt::Interrupted => return StepResolution::Interrupted,
                Attempt::Failed(reason) => {
                    let (workflow_id, saga_id, retry_count) = handle.with_saga(|saga| {
                        saga.record_step_error(&step.id, &reason);
                        (saga.workflow_id, saga.saga_id.clone(), saga.retry_count(&step.id))
                    });
                    self.publish(
                        topics::WORKFLOW_STEP_FAILED,
                        &saga_id,
                        handle,
                        &WorkflowStepFailed {
                            workflow_id,
                            saga_id: saga_id.clone(),
                            step_id: step.id.clone(),
                            error: reason.clone(),
                        },
                    );

                    if retry_count < step.retries {
                        handle.with_saga(|saga| {
                            saga.retry_counts.insert(step.id.clone(), retry_count + 1);
                        });
                        let backoff = self.config.backoff_for(retry_count);
                        warn!(
                            workflow_id = %workflow_id,
                            step = %step.id,
                            attempt = retry_count + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %reason,
                            "step failed, retrying"
                        );
                        tokio::select! {
                            _ = handle.cancel.cancelled() => return StepResolution::Interrupted,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    } else {
                        warn!(workflow_id = %workflow_id, step = %step.id, error = %reason, "step permanently failed");
                        return StepResolution::Failed { reason };
                    }
                }
            }
        }
    }

    /// One attempt of a step: dispatch by kind, race against the
    /// timeout and the cancellation token.
    async fn attempt_step(self: &Arc<Self>, handle: &Arc<SagaHandle>, step: &Step) -> Attempt {
        let (workflow_id, saga_id, data) = handle.with_saga(|saga| {
            (saga.workflow_id, saga.saga_id.clone(), saga.data.clone())
        });

        let inputs = match handle.with_saga(|saga| resolve_inputs(step, saga)) {
            Ok(inputs) => inputs,
            Err(missing) => return Attempt::Failed(format!("missing-input: {missing}")),
        };

        match step.kind {
            StepKind::System => {
                let Some(handler) = self.system_handlers.get(&step.target).cloned() else {
                    return Attempt::Failed(format!("unknown system handler: {}", step.target));
                };
                let ctx = StepContext {
                    workflow_id,
                    saga_id,
                    step_id: step.id.clone(),
                    config: step.config.clone(),
                    inputs,
                    data,
                    blackboard: self.blackboard.clone(),
                    bus: self.bus.clone(),
                };
                tokio::select! {
                    _ = handle.cancel.cancelled() => Attempt::Interrupted,
                    result = tokio::time::timeout(step.timeout, handler.run(ctx)) => match result {
                        Ok(Ok(outputs)) => Attempt::Completed(outputs),
                        Ok(Err(err)) => Attempt::Failed(err.to_string()),
                        Err(_) => Attempt::Failed("timeout".to_string()),
                    },
                }
            }
            StepKind::Stage | StepKind::External => {
                self.ensure_routed(&step.target);

                // Install the waiter before publishing so an instant
                // reply still lands exactly once.
                let rx = self.waiters.register(workflow_id, &step.id);

                let request = StageRequest {
                    workflow_id,
                    saga_id: saga_id.clone(),
                    step_id: step.id.clone(),
                    inputs,
                    config: step.config.clone(),
                };
                let payload = Envelope::payload_of(&request).unwrap_or(Value::Null);
                self.bus.publish(
                    topics::stage_request(&step.target),
                    saga_id,
                    payload,
                    handle.correlation_id,
                );

                tokio::select! {
                    _ = handle.cancel.cancelled() => {
                        self.waiters.discard(workflow_id, &step.id);
                        Attempt::Interrupted
                    }
                    outcome = rx => match outcome {
                        Ok(StepOutcome::Completed(outputs)) => Attempt::Completed(outputs),
                        Ok(StepOutcome::Failed { reason }) => Attempt::Failed(reason),
                        Err(_) => Attempt::Failed("waiter dropped".to_string()),
                    },
                    _ = tokio::time::sleep(step.timeout) => {
                        self.waiters.discard(workflow_id, &step.id);
                        Attempt::Failed("timeout".to_string())
                    }
                }
            }
        }
    }

    /// Route a stage target's completion and failure topics into the
    /// waiter table (once per target).
    fn ensure_routed(self: &Arc<Self>, target: &str) {
        if self.routed_targets.insert(target.to_string(), ()).is_some() {
            return;
        }

        let inner = self.clone();
        self.bus.subscribe_fn(topics::stage_completed(target), move |envelope| {
            let inner = inner.clone();
            async move {
                let completion: StageCompletion = envelope.read()?;
                inner.waiters.resolve(
                    completion.workflow_id,
                    &completion.step_id,
                    StepOutcome::Completed(completion.outputs),
                );
                Ok(())
            }
        });

        let inner = self.clone();
        self.bus.subscribe_fn(topics::stage_failed(target), move |envelope| {
            let inner = inner.clone();
            async move {
                let failure: StageFailure = envelope.read()?;
                inner.waiters.resolve(
                    failure.workflow_id,
                    &failure.step_id,
                    StepOutcome::Failed { reason: failure.error },
                );
                Ok(())
            }
        });
    }

    fn complete_step(&self, handle: &Arc<SagaHandle>, step: &Step, outputs: HashMap<String, Value>) {
        let (workflow_id, saga_id) = handle.with_saga(|saga| {
            saga.record_step_success(&step.id, outputs.clone());
            saga.current_step = None;
            (saga.workflow_id, saga.saga_id.clone())
        });
        self.publish(
            topics::WORKFLOW_STEP_COMPLETED,
            &saga_id,
            handle,
            &WorkflowStepCompleted {
                workflow_id,
                saga_id: saga_id.clone(),
                step_id: step.id.clone(),
                result: Value::Object(outputs.into_iter().collect()),
            },
        );
    }

    /// Apply the template's error-handling strategy to a permanently
    /// failed step.
    async fn handle_permanent_failure(
        self: &Arc<Self>,
        handle: &Arc<SagaHandle>,
        step: &Step,
        reason: &str,
    ) -> Disposition {
        let terminal_error = EngineError::RetryExhausted {
            step: step.id.clone(),
            attempts: step.retries + 1,
            reason: reason.to_string(),
        }
        .to_string();

        match handle.template.error_handling.strategy {
            ErrorStrategy::FailFast => {
                self.finish_failed(handle, terminal_error);
                Disposition::Terminal
            }
            ErrorStrategy::Compensate => {
                let actions: Vec<CompensationAction> = handle
                    .template
                    .error_handling
                    .compensation_actions
                    .iter()
                    .filter(|action| action.applies_to(&step.id, reason))
                    .cloned()
                    .collect();
                for action in actions {
                    if let Err(message) = self.run_compensation(handle, &action, reason).await {
                        // Individual compensation failures are tolerated
                        // and recorded; the saga still fails below.
                        handle.with_saga(|saga| saga.record_step_error(&step.id, &message));
                    }
                }
                self.finish_failed(handle, terminal_error);
                Disposition::Terminal
            }
            ErrorStrategy::RetryAndFallback => {
                let matching = handle
                    .template
                    .error_handling
                    .compensation_actions
                    .iter()
                    .find(|action| action.applies_to(&step.id, reason))
                    .cloned();

                if let Some(action) = matching {
                    match self.run_compensation(handle, &action, reason).await {
                        Ok(outputs) => {
                            // The compensation's output becomes the
                            // step's result and the loop resumes.
                            handle.with_saga(|saga| {
                                saga.failed_steps.remove(&step.id);
                            });
                            self.complete_step(handle, step, outputs);
                            info!(
                                step = %step.id,
                                action = %action.action,
                                "compensation substituted step result"
                            );
                            return Disposition::Resumed;
                        }
                        Err(message) => {
                            handle.with_saga(|saga| saga.record_step_error(&step.id, &message));
                        }
                    }
                }

                if let Some(fallback) = handle.template.error_handling.fallback_template.clone() {
                    self.switch_to_fallback(handle, &fallback, reason);
                    Disposition::Terminal
                } else {
                    self.finish_failed(handle, terminal_error);
                    Disposition::Terminal
                }
            }
        }
    }

    /// Run one compensation action. Returns the handler's outputs, or a
    /// `CompensationFailure` message.
    async fn run_compensation(
        &self,
        handle: &Arc<SagaHandle>,
        action: &CompensationAction,
        reason: &str,
    ) -> Result<HashMap<String, Value>, String> {
        let Some(handler) = self.compensation_handlers.get(&action.action).cloned() else {
            return Err(EngineError::CompensationFailure {
                step: action.step.clone(),
                action: action.action.clone(),
                reason: "no handler registered".to_string(),
            }
            .to_string());
        };

        let ctx = handle.with_saga(|saga| CompensationContext {
            workflow_id: saga.workflow_id,
            saga_id: saga.saga_id.clone(),
            failed_step: action.step.clone(),
            action: action.action.clone(),
            failure_reason: reason.to_string(),
            step_results: saga.step_results.clone(),
            data: saga.data.clone(),
            blackboard: self.blackboard.clone(),
            bus: self.bus.clone(),
        });

        info!(step = %action.step, action = %action.action, "running compensation");
        handler.compensate(ctx).await.map_err(|err| {
            EngineError::CompensationFailure {
                step: action.step.clone(),
                action: action.action.clone(),
                reason: err.to_string(),
            }
            .to_string()
        })
    }

    /// Cancel the current saga and restart it under the fallback
    /// template with the same saga id and carried data.
    fn switch_to_fallback(self: &Arc<Self>, handle: &Arc<SagaHandle>, fallback: &str, reason: &str) {
        let (workflow_id, saga_id, data) = handle.with_saga(|saga| {
            (saga.workflow_id, saga.saga_id.clone(), saga.data.clone())
        });

        if !self.finalize(handle, SagaStatus::Cancelled) {
            return;
        }
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        self.publish(
            topics::WORKFLOW_CANCELLED,
            &saga_id,
            handle,
            &WorkflowCancelled {
                workflow_id,
                saga_id: saga_id.clone(),
                reason: format!("switching to fallback template {fallback}: {reason}"),
            },
        );
        info!(workflow_id = %workflow_id, fallback, "switching saga to fallback template");

        match self.start_internal(fallback, saga_id.clone(), data, handle.correlation_id) {
            Ok(new_workflow) => {
                debug!(old = %workflow_id, new = %new_workflow, "fallback workflow started");
            }
            Err(err) => {
                // The primary is already cancelled; surface the dead end
                // so callers waiting on the saga see a terminal event.
                error!(saga_id = %saga_id, error = %err, "fallback admission failed");
                let duration_ms = handle.with_saga(|saga| elapsed_ms(saga));
                let completed_steps = handle.with_saga(|saga| saga.completed_steps.clone());
                self.publish(
                    topics::WORKFLOW_FAILED,
                    &saga_id.clone(),
                    handle,
                    &WorkflowFailed {
                        workflow_id,
                        saga_id,
                        error: format!("fallback admission failed: {err}"),
                        duration_ms,
                        completed_steps,
                    },
                );
            }
        }
    }

    fn finish_completed(&self, handle: &Arc<SagaHandle>) {
        if !self.finalize(handle, SagaStatus::Completed) {
            return;
        }
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        let (workflow_id, saga_id, duration_ms, completed_steps) = handle.with_saga(|saga| {
            (
                saga.workflow_id,
                saga.saga_id.clone(),
                elapsed_ms(saga),
                saga.completed_steps.clone(),
            )
        });
        info!(workflow_id = %workflow_id, saga_id = %saga_id, duration_ms, "workflow completed");
        self.publish(
            topics::WORKFLOW_COMPLETED,
            &saga_id,
            handle,
            &WorkflowCompleted {
                workflow_id,
                saga_id: saga_id.clone(),
                duration_ms,
                completed_steps,
            },
        );
    }

    pub(crate) fn finish_failed(&self, handle: &Arc<SagaHandle>, error: String) {
        if !self.finalize(handle, SagaStatus::Failed) {
            return;
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let (workflow_id, saga_id, duration_ms, completed_steps) = handle.with_saga(|saga| {
            (
                saga.workflow_id,
                saga.saga_id.clone(),
                elapsed_ms(saga),
                saga.completed_steps.clone(),
            )
        });
        error!(workflow_id = %workflow_id, saga_id = %saga_id, error = %error, "workflow failed");
        self.publish(
            topics::WORKFLOW_FAILED,
            &saga_id,
            handle,
            &WorkflowFailed {
                workflow_id,
                saga_id: saga_id.clone(),
                error,
                duration_ms,
                completed_steps,
            },
        );
    }

    fn finish_interrupted(&self, handle: &Arc<SagaHandle>) {
        let cause = handle.take_cancel_cause();
        match cause {
            Some(CancelCause::SlaExceeded { elapsed_ms }) => {
                // A catastrophic SLA breach forces failure, not
                // cancellation, regardless of the current step.
                self.finish_failed(
                    handle,
                    format!("workflow exceeded max duration (elapsed {elapsed_ms} ms)"),
                );
            }
            Some(CancelCause::Requested { reason }) => {
                if !self.finalize(handle, SagaStatus::Cancelled) {
                    return;
                }
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let (workflow_id, saga_id) =
                    handle.with_saga(|saga| (saga.workflow_id, saga.saga_id.clone()));
                info!(workflow_id = %workflow_id, reason = %reason, "workflow cancelled");
                self.publish(
                    topics::WORKFLOW_CANCELLED,
                    &saga_id,
                    handle,
                    &WorkflowCancelled {
                        workflow_id,
                        saga_id: saga_id.clone(),
                        reason,
                    },
                );
            }
            None => {
                self.finish_failed(handle, "driver interrupted without cause".to_string());
            }
        }
    }

    /// Terminal transition plus bookkeeping shared by all finishers.
    /// Returns false when the saga was already terminal.
    fn finalize(&self, handle: &Arc<SagaHandle>, status: SagaStatus) -> bool {
        let (applied, workflow_id, saga_id) = handle.with_saga(|saga| {
            (
                saga.try_set_status(status),
                saga.workflow_id,
                saga.saga_id.clone(),
            )
        });
        if !applied {
            return false;
        }
        self.running.fetch_sub(1, Ordering::AcqRel);
        // Free the saga id for reuse (fallback restart, resubmission).
        self.saga_index
            .remove_if(&saga_id, |_, active| *active == workflow_id);
        true
    }

    fn publish<T: serde::Serialize>(
        &self,
        topic: &str,
        saga_id: &str,
        handle: &SagaHandle,
        payload: &T,
    ) {
        let value = Envelope::payload_of(payload).unwrap_or(Value::Null);
        self.bus
            .publish(topic, saga_id, value, handle.correlation_id);
    }
}

/// SLA evaluation entry point used by the supervisor.
impl EngineInner {
    /// Evaluate one running saga's SLA; emits transition events and
    /// triggers the catastrophic timeout when `max_duration` is crossed.
    pub(crate) fn evaluate_sla(&self, handle: &Arc<SagaHandle>) {
        if handle.is_terminal() {
            return;
        }
        let sla = handle.template.sla;
        let (workflow_id, saga_id, elapsed, old) = handle.with_saga(|saga| {
            (
                saga.workflow_id,
                saga.saga_id.clone(),
                saga.elapsed().to_std().unwrap_or_default(),
                saga.sla_status,
            )
        });

        let new = if elapsed >= sla.max_duration {
            SlaStatus::Exceeded
        } else if elapsed >= sla.critical_threshold {
            SlaStatus::Critical
        } else if elapsed >= sla.warning_threshold {
            SlaStatus::Warning
        } else {
            SlaStatus::Ok
        };

        if new != old {
            handle.with_saga(|saga| saga.sla_status = new);
            let duration_ms = elapsed.as_millis() as u64;
            warn!(workflow_id = %workflow_id, old = %old, new = %new, duration_ms, "sla status changed");
            self.publish(
                topics::WORKFLOW_SLA_STATUS_CHANGED,
                &saga_id,
                handle,
                &SlaStatusChanged {
                    workflow_id,
                    old,
                    new,
                    duration_ms,
                },
            );
        }

        if new == SlaStatus::Exceeded {
            let elapsed_ms = elapsed.as_millis() as u64;
            self.publish(
                topics::WORKFLOW_TIMEOUT,
                &saga_id,
                handle,
                &WorkflowTimeout {
                    workflow_id,
                    saga_id: saga_id.clone(),
                    max_duration_ms: sla.max_duration.as_millis() as u64,
                    elapsed_ms,
                },
            );
            handle.set_cancel_cause(CancelCause::SlaExceeded { elapsed_ms });
            handle.cancel.cancel();
        }
    }

    /// Garbage-collect terminal sagas older than `max_workflow_age`.
    pub(crate) fn reap_terminal(&self) -> usize {
        let now = chrono::Utc::now();
        let max_age = chrono::Duration::from_std(self.config.max_workflow_age)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        let stale: Vec<(WorkflowId, String)> = self
            .sagas
            .iter()
            .filter_map(|entry| {
                entry.with_saga(|saga| {
                    saga.end_time
                        .filter(|end| now - *end > max_age)
                        .map(|_| (saga.workflow_id, saga.saga_id.clone()))
                })
            })
            .collect();

        let mut reaped = 0;
        for (workflow_id, saga_id) in stale {
            if self.sagas.remove(&workflow_id).is_some() {
                reaped += 1;
                // Release the sequence counter unless a newer workflow
                // reuses the saga id.
                if !self.saga_index.contains_key(&saga_id) {
                    self.bus.release_saga(&saga_id);
                }
                debug!(workflow_id = %workflow_id, saga_id = %saga_id, "terminal saga reaped");
            }
        }
        reaped
    }
}

/// First step in declaration order whose dependencies are all
/// completed and which is neither completed nor permanently failed.
fn select_next_step(template: &Template, saga: &Saga) -> Option<Step> {
    template
        .steps
        .iter()
        .find(|step| {
            !saga.completed_steps.iter().any(|done| done == &step.id)
                && !saga.failed_steps.contains(&step.id)
                && step
                    .depends_on
                    .iter()
                    .all(|dep| saga.completed_steps.iter().any(|done| done == dep))
        })
        .cloned()
}

/// Resolve a step's declared inputs from accumulated step results.
fn resolve_inputs(step: &Step, saga: &Saga) -> Result<HashMap<String, Value>, String> {
    let mut inputs = HashMap::with_capacity(step.inputs.len());
    for key in &step.inputs {
        match saga.step_results.get(key) {
            Some(value) => {
                inputs.insert(key.clone(), value.clone());
            }
            None => return Err(key.clone()),
        }
    }
    Ok(inputs)
}

fn elapsed_ms(saga: &Saga) -> u64 {
    saga.elapsed().num_milliseconds().max(0) as u64
}

// =============================================================================
// Builder
// =============================================================================

/// Builder assembling the engine's templates, handlers, and services.
pub struct EngineBuilder {
    config: EngineConfig,
    bus: Option<EventBus>,
    blackboard: Option<Blackboard>,
    templates: Vec<Template>,
    system_handlers: HashMap<String, Arc<dyn SystemHandler>>,
    compensation_handlers: HashMap<String, Arc<dyn CompensationHandler>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            bus: None,
            blackboard: None,
            templates: Vec::new(),
            system_handlers: HashMap::new(),
            compensation_handlers: HashMap::new(),
        }
    }

    /// Use an existing bus instead of creating a new one.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use an existing blackboard instead of creating a new one.
    pub fn with_blackboard(mut self, blackboard: Blackboard) -> Self {
        self.blackboard = Some(blackboard);
        self
    }

    /// Register a template; validated at `build()`.
    pub fn with_template(mut self, template: Template) -> Self {
        self.templates.push(template);
        self
    }

    /// Register an in-process handler for `system` steps.
    pub fn with_system_handler(
        mut self,
        target: impl Into<String>,
        handler: Arc<dyn SystemHandler>,
    ) -> Self {
        self.system_handlers.insert(target.into(), handler);
        self
    }

    /// Register a compensation handler by action name.
    pub fn with_compensation_handler(
        mut self,
        action: impl Into<String>,
        handler: Arc<dyn CompensationHandler>,
    ) -> Self {
        self.compensation_handlers.insert(action.into(), handler);
        self
    }

    /// Validate all templates and start the supervisor.
    pub fn build(self) -> EngineResult<WorkflowEngine> {
        let mut templates = HashMap::new();
        for template in &self.templates {
            template.validate()?;
            if templates
                .insert(template.name.clone(), Arc::new(template.clone()))
                .is_some()
            {
                return Err(EngineError::DependencyViolation(format!(
                    "duplicate template name: {}",
                    template.name
                )));
            }
        }
        for template in templates.values() {
            if let Some(fallback) = &template.error_handling.fallback_template {
                if !templates.contains_key(fallback) {
                    return Err(EngineError::UnknownTemplate(fallback.clone()));
                }
            }
        }

        let bus = self.bus.unwrap_or_default();
        let blackboard = self
            .blackboard
            .unwrap_or_else(|| Blackboard::new(bus.clone(), BlackboardConfig::default()));

        let inner = Arc::new(EngineInner {
            config: self.config,
            bus,
            blackboard,
            templates,
            system_handlers: self.system_handlers,
            compensation_handlers: self.compensation_handlers,
            sagas: dashmap::DashMap::new(),
            saga_index: dashmap::DashMap::new(),
            waiters: WaiterTable::new(),
            routed_targets: dashmap::DashMap::new(),
            running: AtomicUsize::new(0),
            counters: EngineCounters::default(),
            supervisor_shutdown: CancellationToken::new(),
        });

        crate::sla::spawn_supervisor(inner.clone());

        Ok(WorkflowEngine { inner })
    }
}
