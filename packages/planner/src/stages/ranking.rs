//! Candidate ranking: scores 0..1 under a named algorithm, sorted
//! descending, with an optional diversity adjustment that damps
//! repeated providers.

use std::collections::HashMap;

use anyhow::Result;
use caravan::{StageContext, StageHandler, StageRequest};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{config_bool, config_str, require_input, simulate_latency};

pub struct RankingStage;

fn base_score(candidate: &Value, algorithm: &str) -> f64 {
    let rating = candidate.get("rating").and_then(Value::as_f64).unwrap_or(0.0) / 5.0;
    let price = candidate.get("price").and_then(Value::as_f64).unwrap_or(0.0);
    // Cheaper is better; normalize against a soft ceiling.
    let price_value = 1.0 - (price / 500.0).min(1.0);
    let validation = candidate
        .get("validation_score")
        .and_then(Value::as_f64)
        .unwrap_or(1.0);

    match algorithm {
        "popularity" => rating,
        // Default: blend quality, value, and validation confidence.
        _ => 0.5 * rating + 0.3 * price_value + 0.2 * validation,
    }
}

fn rank_category(list: &[Value], algorithm: &str, diversity: bool) -> Vec<Value> {
    let mut scored: Vec<Value> = list
        .iter()
        .map(|candidate| {
            let mut scored = candidate.clone();
            let score = base_score(candidate, algorithm).clamp(0.0, 1.0);
            if let Some(object) = scored.as_object_mut() {
                object.insert("score".to_string(), json!((score * 1000.0).round() / 1000.0));
            }
            scored
        })
        .collect();

    scored.sort_by(|a, b| {
        let sa = a["score"].as_f64().unwrap_or(0.0);
        let sb = b["score"].as_f64().unwrap_or(0.0);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });

    if diversity {
        // Damp repeated providers so one feed cannot sweep a category.
        let mut seen: HashMap<String, u32> = HashMap::new();
        for candidate in &mut scored {
            let provider = candidate
                .get("provider")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let repeats = seen.entry(provider).or_insert(0);
            if *repeats > 0 {
                let score = candidate["score"].as_f64().unwrap_or(0.0);
                let damped = (score * (1.0 - 0.1 * *repeats as f64)).max(0.0);
                candidate["score"] = json!((damped * 1000.0).round() / 1000.0);
            }
            *repeats += 1;
        }
        scored.sort_by(|a, b| {
            let sa = a["score"].as_f64().unwrap_or(0.0);
            let sb = b["score"].as_f64().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    scored
}

#[async_trait::async_trait]
impl StageHandler for RankingStage {
    fn name(&self) -> &'static str {
        "ranking"
    }

    async fn handle(&self, request: StageRequest, _ctx: StageContext) -> Result<HashMap<String, Value>> {
        simulate_latency(&request.config).await;

        let validated = require_input(&request, "candidates-validated")?;
        let algorithm = config_str(&request.config, "algorithm", "weighted");
        let diversity = config_bool(&request.config, "diversity_boost", true);

        let mut ranked = Map::new();
        for (category, list) in validated.as_object().into_iter().flatten() {
            let candidates = list.as_array().cloned().unwrap_or_default();
            ranked.insert(
                category.clone(),
                Value::Array(rank_category(&candidates, algorithm, diversity)),
            );
        }

        debug!(saga_id = %request.saga_id, algorithm, "candidates ranked");
        Ok(HashMap::from([(
            "candidates-ranked".to_string(),
            Value::Object(ranked),
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, price: f64, rating: f64, provider: &str) -> Value {
        json!({
            "id": id,
            "price": price,
            "rating": rating,
            "provider": provider,
            "validation_score": 1.0,
        })
    }

    #[test]
    fn test_scores_are_clamped_and_sorted_descending() {
        let ranked = rank_category(
            &[
                candidate("cheap", 40.0, 3.0, "a"),
                candidate("great", 90.0, 5.0, "b"),
                candidate("bad", 480.0, 1.0, "c"),
            ],
            "weighted",
            false,
        );
        let scores: Vec<f64> = ranked.iter().map(|c| c["score"].as_f64().unwrap()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
        assert_eq!(ranked[0]["id"], "great");
    }

    #[test]
    fn test_popularity_algorithm_ranks_by_rating_only() {
        let ranked = rank_category(
            &[
                candidate("pricey-but-loved", 490.0, 5.0, "a"),
                candidate("cheap-but-meh", 20.0, 2.0, "b"),
            ],
            "popularity",
            false,
        );
        assert_eq!(ranked[0]["id"], "pricey-but-loved");
    }

    #[test]
    fn test_diversity_damps_repeated_providers() {
        let ranked = rank_category(
            &[
                candidate("a1", 100.0, 4.8, "mono"),
                candidate("a2", 100.0, 4.7, "mono"),
                candidate("b1", 100.0, 4.6, "other"),
            ],
            "weighted",
            true,
        );
        // The second mono-provider entry loses enough score to fall
        // behind the other provider.
        assert_eq!(ranked[1]["id"], "b1");
    }
}
