//! Application assembly: one bus, one blackboard, one engine, all
//! stages mounted.

use std::sync::Arc;

use caravan::{
    Blackboard, BlackboardConfig, EngineConfig, EngineResult, EventBus, InvalidationRule,
    Namespace, WorkflowEngine,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::stages::{
    CandidateStage, EnrichmentStage, OutputStage, RankingStage, SelectionStage, ValidationStage,
};
use crate::system::{FinalizeHandler, InitializeHandler, SkipEnrichment};
use crate::templates::{travel_planning, travel_planning_basic};

/// A fully wired planner: engine, bus, blackboard, and background
/// sweepers.
pub struct PlannerRuntime {
    pub engine: WorkflowEngine,
    pub bus: EventBus,
    pub blackboard: Blackboard,
    shutdown: CancellationToken,
}

impl PlannerRuntime {
    /// Stop the blackboard sweeper and the engine supervisor. Running
    /// sagas drive on to their terminal states.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.engine.shutdown();
    }
}

/// Blackboard configuration with the planner's invalidation rules on
/// top of the default TTL rules.
pub fn blackboard_config() -> BlackboardConfig {
    BlackboardConfig::default()
        .with_invalidation_rule(InvalidationRule::new(
            "price drift*",
            Namespace::Candidates,
            "*",
        ))
        .with_invalidation_rule(InvalidationRule::new(
            "reverify*",
            Namespace::Selections,
            "*",
        ))
}

/// Build the full planner runtime on a fresh bus.
pub fn build_runtime(engine_config: EngineConfig) -> EngineResult<PlannerRuntime> {
    let bus = EventBus::new();
    let blackboard = Blackboard::new(bus.clone(), blackboard_config());
    blackboard.wire_invalidations();

    let shutdown = CancellationToken::new();
    blackboard.spawn_sweeper(shutdown.clone());

    let engine = WorkflowEngine::builder(engine_config)
        .with_bus(bus.clone())
        .with_blackboard(blackboard.clone())
        .with_template(travel_planning())
        .with_template(travel_planning_basic())
        .with_system_handler("initialize", Arc::new(InitializeHandler))
        .with_system_handler("finalize", Arc::new(FinalizeHandler))
        .with_compensation_handler("skip-enrichment", Arc::new(SkipEnrichment))
        .build()?;

    caravan::mount_stage(&bus, blackboard.clone(), Arc::new(CandidateStage));
    caravan::mount_stage(&bus, blackboard.clone(), Arc::new(ValidationStage));
    caravan::mount_stage(&bus, blackboard.clone(), Arc::new(RankingStage));
    caravan::mount_stage(&bus, blackboard.clone(), Arc::new(SelectionStage));
    caravan::mount_stage(&bus, blackboard.clone(), Arc::new(EnrichmentStage));
    caravan::mount_stage(&bus, blackboard.clone(), Arc::new(OutputStage));

    info!("planner runtime assembled");
    Ok(PlannerRuntime {
        engine,
        bus,
        blackboard,
        shutdown,
    })
}
