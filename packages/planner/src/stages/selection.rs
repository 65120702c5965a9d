//! Selection: choose a bounded subset under budget, diversity, and
//! risk constraints, under a named strategy. Selections land in the
//! strong `selections` namespace before the result is returned.

use std::collections::HashMap;

use anyhow::Result;
use caravan::{Namespace, StageContext, StageHandler, StageRequest, WriteOptions};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{config_str, config_u64, require_input, simulate_latency};

pub struct SelectionStage;

struct Constraints {
    budget: f64,
    max_per_category: usize,
    /// At most one synthetic placeholder per category; placeholders are
    /// a booking risk.
    max_placeholders: usize,
}

fn price_of(candidate: &Value) -> f64 {
    candidate.get("price").and_then(Value::as_f64).unwrap_or(0.0)
}

fn is_placeholder(candidate: &Value) -> bool {
    candidate
        .get("placeholder")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Balanced strategy: walk each category's ranking in order, taking the
/// best affordable options category by category.
fn select_balanced(pool: &Map<String, Value>, constraints: &Constraints) -> (Map<String, Value>, f64) {
    let mut selected = Map::new();
    let mut spent = 0.0;

    for (category, list) in pool {
        let mut chosen: Vec<Value> = Vec::new();
        let mut placeholders = 0usize;
        for candidate in list.as_array().into_iter().flatten() {
            if chosen.len() >= constraints.max_per_category {
                break;
            }
            let price = price_of(candidate);
            if spent + price > constraints.budget {
                continue;
            }
            if is_placeholder(candidate) {
                if placeholders >= constraints.max_placeholders {
                    continue;
                }
                placeholders += 1;
            }
            spent += price;
            chosen.push(candidate.clone());
        }
        selected.insert(category.clone(), Value::Array(chosen));
    }
    (selected, spent)
}

/// Budget-first strategy: cheapest options across all categories first,
/// still bounded per category.
fn select_budget_first(pool: &Map<String, Value>, constraints: &Constraints) -> (Map<String, Value>, f64) {
    let mut flat: Vec<(String, Value)> = pool
        .iter()
        .flat_map(|(category, list)| {
            list.as_array()
                .into_iter()
                .flatten()
                .map(move |c| (category.clone(), c.clone()))
        })
        .collect();
    flat.sort_by(|a, b| {
        price_of(&a.1)
            .partial_cmp(&price_of(&b.1))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selected: Map<String, Value> = pool
        .keys()
        .map(|category| (category.clone(), Value::Array(Vec::new())))
        .collect();
    let mut placeholder_counts: HashMap<String, usize> = HashMap::new();
    let mut spent = 0.0;

    for (category, candidate) in flat {
        let Some(slot) = selected.get_mut(&category).and_then(Value::as_array_mut) else {
            continue;
        };
        if slot.len() >= constraints.max_per_category {
            continue;
        }
        let price = price_of(&candidate);
        if spent + price > constraints.budget {
            continue;
        }
        if is_placeholder(&candidate) {
            let count = placeholder_counts.entry(category.clone()).or_insert(0);
            if *count >= constraints.max_placeholders {
                continue;
            }
            *count += 1;
        }
        spent += price;
        slot.push(candidate);
    }
    (selected, spent)
}

#[async_trait::async_trait]
impl StageHandler for SelectionStage {
    fn name(&self) -> &'static str {
        "selection"
    }

    async fn handle(&self, request: StageRequest, ctx: StageContext) -> Result<HashMap<String, Value>> {
        simulate_latency(&request.config).await;

        // The basic pipeline feeds validated (un-ranked) candidates
        // straight in; the source key is part of the step config.
        let source_key = config_str(&request.config, "source", "candidates-ranked").to_string();
        let pool = require_input(&request, &source_key)?
            .as_object()
            .cloned()
            .unwrap_or_default();
        let context = require_input(&request, "trip-context")?;

        let constraints = Constraints {
            budget: context.get("budget").and_then(Value::as_f64).unwrap_or(f64::MAX),
            max_per_category: config_u64(&request.config, "max_per_category", 2) as usize,
            max_placeholders: config_u64(&request.config, "max_placeholders", 1) as usize,
        };
        let strategy = config_str(&request.config, "strategy", "balanced");

        let (items, total_price) = match strategy {
            "budget-first" => select_budget_first(&pool, &constraints),
            _ => select_balanced(&pool, &constraints),
        };

        let picked: usize = items
            .values()
            .filter_map(Value::as_array)
            .map(Vec::len)
            .sum();
        if picked == 0 {
            anyhow::bail!("selection produced no items within budget");
        }

        let selection = json!({
            "items": Value::Object(items),
            "total_price": total_price,
            "strategy": strategy,
        });

        // Strong namespace: the consistency notification is emitted
        // before this write returns.
        ctx.blackboard
            .write(
                Namespace::Selections,
                format!("final:{}", request.saga_id),
                selection.clone(),
                WriteOptions::default(),
            )
            .await;

        debug!(saga_id = %request.saga_id, picked, total_price, strategy, "selection made");
        Ok(HashMap::from([(
            "candidates-selected".to_string(),
            selection,
        )]))
    }
}
