//! Infrastructure step handlers: initialize, finalize, and the
//! skip-enrichment compensation.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use caravan::{
    CompensationContext, CompensationHandler, Namespace, StepContext, SystemHandler, WriteOptions,
};
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Seeds the blackboard from the request data and derives the trip
/// context every later step consumes.
pub struct InitializeHandler;

fn nights_between(data: &Value) -> u64 {
    let parse = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    };
    match (parse("start_date"), parse("end_date")) {
        (Some(start), Some(end)) => (end - start).num_days().max(1) as u64,
        _ => 3,
    }
}

#[async_trait::async_trait]
impl SystemHandler for InitializeHandler {
    async fn run(&self, ctx: StepContext) -> Result<HashMap<String, Value>> {
        let destination = ctx
            .data
            .get("destination")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing required data: destination"))?
            .to_string();
        let budget = ctx
            .data
            .get("budget")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("missing required data: budget"))?;
        let party_size = ctx.data.get("party_size").and_then(Value::as_u64).unwrap_or(1);
        let preferences = ctx
            .data
            .get("preferences")
            .cloned()
            .unwrap_or_else(|| json!({}));

        ctx.blackboard
            .write(
                Namespace::UserInput,
                format!("request:{}", ctx.saga_id),
                ctx.data.clone(),
                WriteOptions::default(),
            )
            .await;
        ctx.blackboard
            .write(
                Namespace::Prefs,
                format!("profile:{}", ctx.saga_id),
                preferences.clone(),
                WriteOptions::default(),
            )
            .await;
        ctx.blackboard
            .write(
                Namespace::Constraints,
                format!("budget:{}", ctx.saga_id),
                json!({"budget": budget, "party_size": party_size}),
                WriteOptions::default(),
            )
            .await;

        let context = json!({
            "destination": destination,
            "nights": nights_between(&ctx.data),
            "party_size": party_size,
            "budget": budget,
            "interests": preferences.get("interests").cloned().unwrap_or(json!([])),
        });
        debug!(saga_id = %ctx.saga_id, destination = %destination, "trip context initialized");

        Ok(HashMap::from([("trip-context".to_string(), context)]))
    }
}

/// Records the audit trail entry and produces the trip summary.
pub struct FinalizeHandler;

#[async_trait::async_trait]
impl SystemHandler for FinalizeHandler {
    async fn run(&self, ctx: StepContext) -> Result<HashMap<String, Value>> {
        let itinerary = ctx
            .inputs
            .get("output-generated")
            .ok_or_else(|| anyhow!("missing required input: output-generated"))?;

        let booking_count = itinerary
            .get("bookings")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let summary = json!({
            "saga_id": ctx.saga_id,
            "workflow_id": ctx.workflow_id,
            "destination": itinerary.get("destination").cloned().unwrap_or(Value::Null),
            "bookings": booking_count,
            "total_price": itinerary.get("total_price").cloned().unwrap_or(json!(0.0)),
            "enrichment_skipped": itinerary
                .get("enrichment_skipped")
                .cloned()
                .unwrap_or(json!(false)),
            "finalized_at": Utc::now(),
        });

        ctx.blackboard
            .write(
                Namespace::Audit,
                format!("saga:{}", ctx.saga_id),
                summary.clone(),
                WriteOptions::default(),
            )
            .await;
        info!(saga_id = %ctx.saga_id, bookings = booking_count, "itinerary finalized");

        Ok(HashMap::from([("trip-summary".to_string(), summary)]))
    }
}

/// Compensation for an enrichment that never completed: the selected
/// candidates pass through unenriched, flagged `enrichment_skipped`.
pub struct SkipEnrichment;

#[async_trait::async_trait]
impl CompensationHandler for SkipEnrichment {
    async fn compensate(&self, ctx: CompensationContext) -> Result<HashMap<String, Value>> {
        let selected = ctx
            .step_results
            .get("candidates-selected")
            .ok_or_else(|| anyhow!("nothing selected to pass through"))?;

        let mut passthrough = selected.clone();
        if let Some(object) = passthrough.as_object_mut() {
            object.insert("enrichment_skipped".to_string(), json!(true));
        }
        info!(
            saga_id = %ctx.saga_id,
            failed_step = %ctx.failed_step,
            reason = %ctx.failure_reason,
            "enrichment skipped, selection passed through"
        );

        Ok(HashMap::from([(
            "candidates-enriched".to_string(),
            passthrough,
        )]))
    }
}
