//! Candidate generation: per-category inventory meeting minimum counts.
//!
//! Providers are modeled as a latency+result contract returning a
//! bounded amount of synthetic inventory; when a provider falls short
//! of the configured minimum the stage synthesizes placeholder
//! candidates so downstream stages always have material to work with.

use std::collections::HashMap;

use anyhow::Result;
use caravan::{Namespace, StageContext, StageHandler, StageRequest, WriteOptions};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{config_u64, pseudo_fraction, require_input, seed_of, simulate_latency};
use crate::categories::Category;

/// How much inventory the synthetic provider has on hand per category.
const PROVIDER_DEPTH: u64 = 3;

pub struct CandidateStage;

impl CandidateStage {
    /// Synthetic provider call for one category.
    async fn fetch_category(
        category: Category,
        destination: &str,
        provider_depth: u64,
        minimum: u64,
    ) -> Vec<Value> {
        let seed = seed_of(destination) ^ seed_of(category.as_str());
        let mut candidates: Vec<Value> = (0..provider_depth)
            .map(|i| synth_candidate(category, destination, seed, i, false))
            .collect();

        // Provider fell short: pad with placeholders up to the minimum.
        let mut index = provider_depth;
        while (candidates.len() as u64) < minimum {
            candidates.push(synth_candidate(category, destination, seed, index, true));
            index += 1;
        }
        candidates
    }
}

fn synth_candidate(
    category: Category,
    destination: &str,
    seed: u64,
    index: u64,
    placeholder: bool,
) -> Value {
    let jitter = pseudo_fraction(seed.wrapping_add(index));
    let base_price = match category {
        Category::Hotel => 120.0,
        Category::Flight => 340.0,
        Category::Activity => 45.0,
        Category::Restaurant => 60.0,
        Category::Car => 55.0,
    };
    let price = (base_price * (0.7 + jitter)).round();
    let rating = (2.5 + 2.5 * pseudo_fraction(seed.wrapping_add(index).wrapping_mul(7))
        * if placeholder { 0.6 } else { 1.0 })
    .min(5.0);

    json!({
        "id": format!("{}-{}-{}", category.as_str(), seed_of(destination) % 1000, index),
        "category": category.as_str(),
        "name": format!("{} option {} in {}", category.as_str(), index + 1, destination),
        "price": price,
        "rating": (rating * 10.0).round() / 10.0,
        "availability": jitter < 0.9,
        "provider": if placeholder { "synthetic" } else { "partner-feed" },
        "placeholder": placeholder,
    })
}

#[async_trait::async_trait]
impl StageHandler for CandidateStage {
    fn name(&self) -> &'static str {
        "candidate"
    }

    async fn handle(&self, request: StageRequest, ctx: StageContext) -> Result<HashMap<String, Value>> {
        simulate_latency(&request.config).await;

        let context = require_input(&request, "trip-context")?;
        let destination = context
            .get("destination")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("trip-context has no destination"))?;
        let slug = destination.to_lowercase().replace(' ', "-");

        let minimum = config_u64(&request.config, "min_candidates", 4);
        let provider_depth = config_u64(&request.config, "provider_depth", PROVIDER_DEPTH);
        let categories: Vec<Category> = request
            .config
            .get("categories")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(Category::parse)
                    .collect()
            })
            .unwrap_or_else(|| Category::ALL.to_vec());

        // Fan out across categories; the step timeout is the ceiling.
        let fetched = join_all(categories.iter().map(|&category| {
            let slug = slug.clone();
            async move {
                let list =
                    Self::fetch_category(category, &slug, provider_depth, minimum).await;
                (category, list)
            }
        }))
        .await;

        let mut generated = Map::new();
        for (category, list) in fetched {
            // Cache per category under the TTL-ruled key prefix.
            ctx.blackboard
                .write(
                    Namespace::Candidates,
                    format!("{}:{}", category.cache_prefix(), slug),
                    Value::Array(list.clone()),
                    WriteOptions::default(),
                )
                .await;
            debug!(
                category = %category,
                count = list.len(),
                saga_id = %request.saga_id,
                "candidates generated"
            );
            generated.insert(category.as_str().to_string(), Value::Array(list));
        }

        Ok(HashMap::from([(
            "candidates-generated".to_string(),
            Value::Object(generated),
        )]))
    }
}
