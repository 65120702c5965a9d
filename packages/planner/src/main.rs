// Demo entry point: plan one trip end to end.

use std::time::Duration;

use anyhow::{Context, Result};
use caravan::{EngineConfig, SagaStatus, StartOptions};
use planner_core::{build_runtime, TRAVEL_TEMPLATE};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,planner_core=debug,caravan=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting travel planner");

    let runtime = build_runtime(EngineConfig::default())
        .context("failed to assemble planner runtime")?;

    let saga_id = format!("trip-{}", Uuid::new_v4());
    let request = json!({
        "destination": "Lisbon",
        "origin": "New York",
        "start_date": "2026-09-10",
        "end_date": "2026-09-14",
        "party_size": 2,
        "budget": 2500.0,
        "preferences": {"pace": "relaxed", "interests": ["food", "history"]},
    });

    let workflow_id = runtime
        .engine
        .start(TRAVEL_TEMPLATE, &saga_id, request, StartOptions::default())
        .context("failed to admit saga")?;
    tracing::info!(%workflow_id, %saga_id, "saga admitted");

    // Poll until terminal; the SLA supervisor is the backstop.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(330);
    let snapshot = loop {
        let snapshot = runtime.engine.status(workflow_id)?;
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("saga did not terminate within the SLA window");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    match snapshot.status {
        SagaStatus::Completed => {
            let itinerary = snapshot
                .step_results
                .get("output-generated")
                .context("completed saga has no itinerary")?;
            tracing::info!(
                steps = snapshot.completed_steps.len(),
                total_price = %itinerary["total_price"],
                destination = %itinerary["destination"],
                "itinerary ready"
            );
        }
        other => {
            tracing::error!(status = %other, errors = ?snapshot.errors, "saga did not complete");
        }
    }

    runtime.shutdown();
    Ok(())
}
