//! # Caravan
//!
//! A single-process saga orchestration runtime: a templated workflow
//! engine, a namespaced key/value blackboard, and the topic event bus
//! that joins them.
//!
//! ## Architecture
//!
//! ```text
//! start() ──► WorkflowEngine ──► step-start envelopes ──► EventBus
//!                  ▲                                        │
//!                  │ completion / failure envelopes         ▼
//!                  └──────────────────────────────── Stage participants
//!                                                           │
//!                              Blackboard ◄── read/write ───┘
//!                             (TTL, ETag, invalidation)
//! ```
//!
//! A saga is one execution of a [`Template`]: a DAG of steps with
//! per-step timeouts, retry budgets, and compensation hooks. The engine
//! serializes step transitions within a saga while sagas run in
//! parallel; stage participants consume request envelopes and publish
//! completion or failure envelopes, never touching engine state
//! directly. The [`Blackboard`] is the shared working memory: every
//! entry carries a TTL, an ETag fingerprint, and a namespace-determined
//! consistency class.
//!
//! ## Guarantees
//!
//! - **FIFO per saga**: envelopes on one topic are observed in publish
//!   order; sequence numbers are monotonic per saga.
//! - **Exactly-once step advance**: every dispatch installs a one-shot
//!   waiter consumed by whichever of completion, failure, timeout, or
//!   cancellation arrives first; the rest are discarded.
//! - **Terminal is terminal**: a completed, failed, or cancelled saga
//!   never transitions again; late results are dropped.
//! - **In-memory only**: nothing survives a process restart.

mod blackboard;
mod bus;
mod config;
mod engine;
mod envelope;
mod error;
mod events;
mod namespace;
mod pattern;
mod saga;
mod sla;
mod stage;
mod template;
mod waiter;

// Testing utilities (feature-gated).
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Core event payloads and topic names.
pub use events::{
    topics, SlaStatusChanged, StateChanged, StateInvalidate, StateOperation, StrongWrite,
    WorkflowCancelled, WorkflowCompleted, WorkflowFailed, WorkflowStarted, WorkflowStepCompleted,
    WorkflowStepFailed, WorkflowTimeout,
};

// Envelope and bus.
pub use bus::{BusMetrics, EventBus, Subscriber};
pub use envelope::{CorrelationId, Envelope, Topic};

// Blackboard.
pub use blackboard::{etag_of, Blackboard, BlackboardMetrics, EntryView, QueryFilter, WriteOptions};
pub use namespace::{Consistency, Namespace};

// Templates and saga state.
pub use saga::{Saga, SagaSnapshot, SagaStatus, SlaStatus, StepError, WorkflowId};
pub use template::{
    CompensationAction, ErrorHandling, ErrorStrategy, FailureCondition, SlaSpec, Step, StepKind,
    Template, TemplateBuilder,
};

// Engine.
pub use engine::{
    CompensationContext, CompensationHandler, EngineBuilder, EngineMetrics, StartOptions,
    StepContext, SystemHandler, WorkflowEngine,
};

// Stage harness.
pub use stage::{
    mount_stage, StageCompletion, StageContext, StageFailure, StageHandler, StageRequest,
};

// Configuration.
pub use config::{BlackboardConfig, EngineConfig, InvalidationRule, TtlRule};

// Errors.
pub use error::{EngineError, EngineResult};

// Pattern matching used by invalidation and query filters.
pub use pattern::wildcard_match;

// Re-export commonly used external types.
pub use async_trait::async_trait;
