//! Uniform envelope contract for stage participants.
//!
//! Every stage subscribes to its request topic, consumes a
//! [`StageRequest`], and publishes either a [`StageCompletion`] whose
//! output keys match the step's declared outputs or a [`StageFailure`]
//! carrying the error string. Stage internals are opaque to the core;
//! participants may read and write the blackboard directly, but must
//! never block the bus - [`mount_stage`] runs each request in its own
//! task, and the step timeout is the sole ceiling.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::blackboard::Blackboard;
use crate::bus::EventBus;
use crate::envelope::Envelope;
use crate::events::topics;
use crate::saga::WorkflowId;

/// Request envelope delivered to a stage participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub step_id: String,
    /// Input payloads resolved from earlier steps' results, keyed by
    /// output key.
    pub inputs: HashMap<String, Value>,
    /// Opaque step configuration from the template.
    pub config: Value,
}

/// Successful stage response; `outputs` keys match the step's declared
/// outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCompletion {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub step_id: String,
    pub outputs: HashMap<String, Value>,
}

/// Failed stage response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailure {
    pub workflow_id: WorkflowId,
    pub saga_id: String,
    pub step_id: String,
    pub error: String,
}

/// Shared services available to a stage participant.
#[derive(Clone)]
pub struct StageContext {
    pub blackboard: Blackboard,
    pub bus: EventBus,
}

/// A pipeline stage participant.
///
/// Errors returned from `handle` are published as the stage's failure
/// payload; the engine's retry loop and error-handling strategy take it
/// from there.
#[async_trait::async_trait]
pub trait StageHandler: Send + Sync + 'static {
    /// The stage name; determines the request/completion/failure topics.
    fn name(&self) -> &'static str;

    /// Process one request and produce outputs keyed by the step's
    /// declared output keys.
    async fn handle(&self, request: StageRequest, ctx: StageContext) -> Result<HashMap<String, Value>>;
}

/// Subscribe a stage participant to its request topic.
///
/// Each incoming request is handled in a spawned task so slow stages
/// never stall the topic's delivery worker.
pub fn mount_stage(bus: &EventBus, blackboard: Blackboard, handler: Arc<dyn StageHandler>) {
    let name = handler.name();
    let ctx = StageContext {
        blackboard,
        bus: bus.clone(),
    };
    let bus_for_replies = bus.clone();

    bus.subscribe_fn(topics::stage_request(name), move |envelope: Envelope| {
        let handler = handler.clone();
        let ctx = ctx.clone();
        let bus = bus_for_replies.clone();
        async move {
            let request: StageRequest = envelope.read()?;
            let correlation_id = envelope.correlation_id;
            tokio::spawn(async move {
                let name = handler.name();
                let saga_id = request.saga_id.clone();
                let workflow_id = request.workflow_id;
                let step_id = request.step_id.clone();
                debug!(stage = name, saga_id = %saga_id, step = %step_id, "stage request received");

                match handler.handle(request, ctx).await {
                    Ok(outputs) => {
                        let payload = Envelope::payload_of(&StageCompletion {
                            workflow_id,
                            saga_id: saga_id.clone(),
                            step_id,
                            outputs,
                        })
                        .unwrap_or(Value::Null);
                        bus.publish(topics::stage_completed(name), saga_id, payload, correlation_id);
                    }
                    Err(err) => {
                        warn!(stage = name, saga_id = %saga_id, error = %err, "stage failed");
                        let payload = Envelope::payload_of(&StageFailure {
                            workflow_id,
                            saga_id: saga_id.clone(),
                            step_id,
                            error: err.to_string(),
                        })
                        .unwrap_or(Value::Null);
                        bus.publish(topics::stage_failed(name), saga_id, payload, correlation_id);
                    }
                }
            });
            Ok(())
        }
    });
}
