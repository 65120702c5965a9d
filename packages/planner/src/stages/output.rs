//! Output packaging: assemble the final itinerary artifact and store
//! it in the strong `itinerary` namespace.

use std::collections::HashMap;

use anyhow::Result;
use caravan::{Namespace, StageContext, StageHandler, StageRequest, WriteOptions};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{config_str, require_input, simulate_latency};

pub struct OutputStage;

/// Spread datable items (activities, restaurants) across the trip's
/// days; hotels, flights, and cars become trip-wide bookings.
fn build_days(items: &Map<String, Value>, nights: u64) -> Vec<Value> {
    let days = nights.max(1);
    let mut per_day: Vec<Vec<Value>> = (0..days).map(|_| Vec::new()).collect();

    let mut slot = 0usize;
    for category in ["activity", "restaurant"] {
        for item in items
            .get(category)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            per_day[slot % days as usize].push(json!({
                "category": category,
                "id": item["id"],
                "name": item["name"],
                "price": item["price"],
            }));
            slot += 1;
        }
    }

    per_day
        .into_iter()
        .enumerate()
        .map(|(i, entries)| json!({"day": i + 1, "entries": entries}))
        .collect()
}

fn bookings(items: &Map<String, Value>) -> Vec<Value> {
    ["flight", "hotel", "car"]
        .iter()
        .flat_map(|category| {
            items
                .get(*category)
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .map(|item| {
                    json!({
                        "category": category,
                        "id": item["id"],
                        "name": item["name"],
                        "price": item["price"],
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

#[async_trait::async_trait]
impl StageHandler for OutputStage {
    fn name(&self) -> &'static str {
        "output"
    }

    async fn handle(&self, request: StageRequest, ctx: StageContext) -> Result<HashMap<String, Value>> {
        simulate_latency(&request.config).await;

        let source_key = config_str(&request.config, "source", "candidates-enriched").to_string();
        let selection = require_input(&request, &source_key)?;
        let context = require_input(&request, "trip-context")?;

        let items = selection
            .get("items")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let nights = context.get("nights").and_then(Value::as_u64).unwrap_or(3);

        let itinerary = json!({
            "saga_id": request.saga_id,
            "destination": context.get("destination").cloned().unwrap_or(Value::Null),
            "party_size": context.get("party_size").cloned().unwrap_or(Value::Null),
            "nights": nights,
            "bookings": bookings(&items),
            "days": build_days(&items, nights),
            "total_price": selection.get("total_price").cloned().unwrap_or(json!(0.0)),
            "enrichment_skipped": selection
                .get("enrichment_skipped")
                .cloned()
                .unwrap_or(json!(false)),
            "generated_at": Utc::now(),
        });

        ctx.blackboard
            .write(
                Namespace::Itinerary,
                format!("itinerary:{}", request.saga_id),
                itinerary.clone(),
                WriteOptions::default(),
            )
            .await;

        debug!(saga_id = %request.saga_id, "itinerary packaged");
        Ok(HashMap::from([(
            "output-generated".to_string(),
            itinerary,
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Map<String, Value> {
        let mut items = Map::new();
        items.insert(
            "hotel".to_string(),
            json!([{"id": "h1", "name": "Hotel", "price": 150.0}]),
        );
        items.insert(
            "activity".to_string(),
            json!([
                {"id": "a1", "name": "Museum", "price": 20.0},
                {"id": "a2", "name": "Boat", "price": 35.0},
                {"id": "a3", "name": "Walk", "price": 0.0},
            ]),
        );
        items
    }

    #[test]
    fn test_days_round_robin_across_nights() {
        let days = build_days(&items(), 2);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0]["entries"].as_array().unwrap().len(), 2);
        assert_eq!(days[1]["entries"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_zero_nights_still_yields_one_day() {
        let days = build_days(&items(), 0);
        assert_eq!(days.len(), 1);
        assert_eq!(days[0]["entries"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_bookings_cover_trip_wide_categories() {
        let bookings = bookings(&items());
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0]["category"], "hotel");
    }
}
