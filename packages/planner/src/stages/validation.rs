//! Candidate validation: required fields, price bands, quality,
//! availability. Each surviving candidate is annotated with a
//! `validation_score` plus error and warning lists; failures are
//! filtered out.

use std::collections::HashMap;

use anyhow::Result;
use caravan::{Namespace, StageContext, StageHandler, StageRequest, WriteOptions};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{config_f64, require_input, simulate_latency};

/// Fields every candidate must carry to be usable downstream.
const REQUIRED_FIELDS: [&str; 4] = ["id", "name", "price", "category"];

pub struct ValidationStage;

fn validate_candidate(candidate: &Value, price_cap: f64, min_rating: f64) -> Value {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    for field in REQUIRED_FIELDS {
        if candidate.get(field).is_none() {
            errors.push(format!("missing field: {field}"));
        }
    }

    if let Some(price) = candidate.get("price").and_then(Value::as_f64) {
        if price > price_cap {
            errors.push(format!("price {price} above cap {price_cap}"));
        } else if price > price_cap * 0.8 {
            warnings.push("price close to cap".to_string());
        }
    }

    if !candidate
        .get("availability")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        errors.push("not available".to_string());
    }

    let rating = candidate.get("rating").and_then(Value::as_f64).unwrap_or(0.0);
    if rating < min_rating {
        errors.push(format!("rating {rating} below minimum {min_rating}"));
    } else if rating < min_rating + 0.5 {
        warnings.push("rating near minimum".to_string());
    }

    if candidate
        .get("placeholder")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        warnings.push("synthetic placeholder".to_string());
    }

    let score = (1.0 - 0.5 * errors.len() as f64 - 0.1 * warnings.len() as f64).clamp(0.0, 1.0);

    let mut annotated = candidate.clone();
    if let Some(object) = annotated.as_object_mut() {
        object.insert("validation_score".to_string(), json!(score));
        object.insert("errors".to_string(), json!(errors));
        object.insert("warnings".to_string(), json!(warnings));
    }
    annotated
}

#[async_trait::async_trait]
impl StageHandler for ValidationStage {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn handle(&self, request: StageRequest, ctx: StageContext) -> Result<HashMap<String, Value>> {
        simulate_latency(&request.config).await;

        let generated = require_input(&request, "candidates-generated")?;
        let context = require_input(&request, "trip-context")?;
        let budget = context.get("budget").and_then(Value::as_f64).unwrap_or(f64::MAX);

        // A single item may not consume more than this share of budget.
        let price_share = config_f64(&request.config, "max_price_share", 0.6);
        let price_cap = budget * price_share;
        let min_rating = config_f64(&request.config, "min_rating", 2.0);

        let mut validated = Map::new();
        let mut kept_total = 0usize;
        let mut dropped_total = 0usize;

        for (category, list) in generated.as_object().into_iter().flatten() {
            let candidates = list.as_array().cloned().unwrap_or_default();
            let annotated: Vec<Value> = candidates
                .iter()
                .map(|candidate| validate_candidate(candidate, price_cap, min_rating))
                .collect();

            let (kept, dropped): (Vec<Value>, Vec<Value>) = annotated
                .into_iter()
                .partition(|c| c["errors"].as_array().is_some_and(|e| e.is_empty()));

            kept_total += kept.len();
            dropped_total += dropped.len();
            validated.insert(category.clone(), Value::Array(kept));
        }

        debug!(
            saga_id = %request.saga_id,
            kept = kept_total,
            dropped = dropped_total,
            "candidates validated"
        );
        ctx.blackboard
            .write(
                Namespace::Evals,
                format!("validation:{}", request.saga_id),
                json!({"kept": kept_total, "dropped": dropped_total, "price_cap": price_cap}),
                WriteOptions::default(),
            )
            .await;

        if kept_total == 0 {
            anyhow::bail!("validation rejected every candidate");
        }

        Ok(HashMap::from([(
            "candidates-validated".to_string(),
            Value::Object(validated),
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(price: f64, rating: f64, available: bool) -> Value {
        json!({
            "id": "x-1",
            "name": "X",
            "category": "hotel",
            "price": price,
            "rating": rating,
            "availability": available,
            "placeholder": false,
        })
    }

    #[test]
    fn test_clean_candidate_scores_high() {
        let validated = validate_candidate(&candidate(100.0, 4.5, true), 500.0, 2.0);
        assert!(validated["errors"].as_array().unwrap().is_empty());
        assert_eq!(validated["validation_score"], json!(1.0));
    }

    #[test]
    fn test_price_above_cap_is_an_error() {
        let validated = validate_candidate(&candidate(600.0, 4.5, true), 500.0, 2.0);
        let errors = validated["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].as_str().unwrap().contains("above cap"));
    }

    #[test]
    fn test_unavailable_and_low_rating_accumulate_errors() {
        let validated = validate_candidate(&candidate(100.0, 1.0, false), 500.0, 2.0);
        let errors = validated["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(validated["validation_score"], json!(0.0));
    }

    #[test]
    fn test_missing_field_is_an_error() {
        let incomplete = json!({"id": "x", "name": "X", "category": "hotel", "availability": true, "rating": 4.0});
        let validated = validate_candidate(&incomplete, 500.0, 2.0);
        let errors = validated["errors"].as_array().unwrap();
        assert!(errors.iter().any(|e| e.as_str().unwrap().contains("price")));
    }
}
