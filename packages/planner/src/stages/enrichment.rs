//! Enrichment: augment selected items with supplementary data from the
//! declared services (weather, media, local info). Each service is a
//! latency+result contract; the enrichment score per item is the
//! fraction of services that returned data.

use std::collections::HashMap;

use anyhow::Result;
use caravan::{Namespace, StageContext, StageHandler, StageRequest, WriteOptions};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{pseudo_fraction, require_input, seed_of, simulate_latency};

pub struct EnrichmentStage;

fn weather_for(destination: &str) -> Value {
    let seed = seed_of(destination);
    let forecast = match seed % 3 {
        0 => "sunny",
        1 => "mild",
        _ => "showers",
    };
    json!({
        "forecast": forecast,
        "temp_c": (12.0 + 18.0 * pseudo_fraction(seed)).round(),
    })
}

fn media_for(item_id: &str, category: &str) -> Value {
    json!([
        format!("https://media.example/{category}/{item_id}/hero.jpg"),
        format!("https://media.example/{category}/{item_id}/gallery-1.jpg"),
    ])
}

fn local_info_for(destination: &str, category: &str) -> Value {
    json!({
        "tip": format!("book {category} options in {destination} a day ahead"),
    })
}

#[async_trait::async_trait]
impl StageHandler for EnrichmentStage {
    fn name(&self) -> &'static str {
        "enrichment"
    }

    async fn handle(&self, request: StageRequest, ctx: StageContext) -> Result<HashMap<String, Value>> {
        simulate_latency(&request.config).await;

        let selected = require_input(&request, "candidates-selected")?;
        let items = selected
            .get("items")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let services: Vec<String> = request
            .config
            .get("services")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec!["weather".into(), "media".into(), "local-info".into()]);

        // Destination travels with the media keys; fall back to the
        // item ids when the request data is opaque.
        let destination = selected
            .get("destination")
            .and_then(Value::as_str)
            .unwrap_or("destination")
            .to_string();

        let mut enriched_items = Map::new();
        for (category, list) in &items {
            let mut enriched_list = Vec::new();
            for candidate in list.as_array().into_iter().flatten() {
                let item_id = candidate
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();

                let mut enrichment = Map::new();
                for service in &services {
                    match service.as_str() {
                        "weather" => {
                            enrichment.insert("weather".to_string(), weather_for(&destination));
                        }
                        "media" => {
                            let media = media_for(&item_id, category);
                            ctx.blackboard
                                .write(
                                    Namespace::Media,
                                    format!("item:{item_id}"),
                                    media.clone(),
                                    WriteOptions::default(),
                                )
                                .await;
                            enrichment.insert("media".to_string(), media);
                        }
                        "local-info" => {
                            enrichment
                                .insert("local_info".to_string(), local_info_for(&destination, category));
                        }
                        other => {
                            debug!(service = other, "unknown enrichment service skipped");
                        }
                    }
                }

                let score = enrichment.len() as f64 / services.len().max(1) as f64;
                let mut enriched = candidate.clone();
                if let Some(object) = enriched.as_object_mut() {
                    object.insert("enrichment".to_string(), Value::Object(enrichment));
                    object.insert(
                        "enrichment_score".to_string(),
                        json!((score * 100.0).round() / 100.0),
                    );
                }
                enriched_list.push(enriched);
            }
            enriched_items.insert(category.clone(), Value::Array(enriched_list));
        }

        let mut result = selected.clone();
        if let Some(object) = result.as_object_mut() {
            object.insert("items".to_string(), Value::Object(enriched_items));
            object.insert("enrichment_skipped".to_string(), json!(false));
        }

        debug!(saga_id = %request.saga_id, services = services.len(), "selection enriched");
        Ok(HashMap::from([(
            "candidates-enriched".to_string(),
            result,
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weather_is_deterministic_per_destination() {
        assert_eq!(weather_for("lisbon"), weather_for("lisbon"));
        let temp = weather_for("lisbon")["temp_c"].as_f64().unwrap();
        assert!((12.0..=30.0).contains(&temp));
    }

    #[test]
    fn test_media_urls_carry_item_and_category() {
        let media = media_for("hotel-1", "hotel");
        let urls = media.as_array().unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].as_str().unwrap().contains("hotel-1"));
    }
}
