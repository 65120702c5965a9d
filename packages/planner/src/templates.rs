//! Workflow templates for travel planning.

use std::time::Duration;

use caravan::{
    CompensationAction, ErrorStrategy, FailureCondition, SlaSpec, Step, Template,
};
use serde_json::json;

/// Name of the full eight-step pipeline.
pub const TRAVEL_TEMPLATE: &str = "travel-planning";
/// Name of the reduced fallback pipeline.
pub const BASIC_TEMPLATE: &str = "travel-planning-basic";

/// The full pipeline: initialize → candidates → validation → ranking →
/// selection → enrichment → output → finalize.
pub fn travel_planning() -> Template {
    Template::builder(TRAVEL_TEMPLATE)
        .with_step(
            Step::system("initialize", "initialize")
                .with_timeout(Duration::from_secs(5))
                .with_output("trip-context"),
        )
        .with_step(
            Step::stage("generate-candidates", "candidate")
                .depends_on("initialize")
                .with_input("trip-context")
                .with_output("candidates-generated")
                .with_timeout(Duration::from_secs(10))
                .with_retries(2)
                .with_config(json!({"min_candidates": 4, "latency_ms": 5})),
        )
        .with_step(
            Step::stage("validate-candidates", "validation")
                .depends_on("generate-candidates")
                .with_input("candidates-generated")
                .with_input("trip-context")
                .with_output("candidates-validated")
                .with_timeout(Duration::from_secs(5))
                .with_retries(1)
                .with_config(json!({"min_rating": 2.0, "max_price_share": 0.6})),
        )
        .with_step(
            Step::stage("rank-candidates", "ranking")
                .depends_on("validate-candidates")
                .with_input("candidates-validated")
                .with_output("candidates-ranked")
                .with_timeout(Duration::from_secs(5))
                .with_retries(1)
                .with_config(json!({"algorithm": "weighted", "diversity_boost": true})),
        )
        .with_step(
            Step::stage("select-candidates", "selection")
                .depends_on("rank-candidates")
                .with_input("candidates-ranked")
                .with_input("trip-context")
                .with_output("candidates-selected")
                .with_timeout(Duration::from_secs(5))
                .with_retries(1)
                .with_config(json!({"strategy": "balanced", "max_per_category": 2})),
        )
        .with_step(
            Step::stage("enrich-candidates", "enrichment")
                .depends_on("select-candidates")
                .with_input("candidates-selected")
                .with_output("candidates-enriched")
                .with_timeout(Duration::from_secs(8))
                .with_retries(2)
                .with_config(json!({"services": ["weather", "media", "local-info"], "latency_ms": 5})),
        )
        .with_step(
            Step::stage("generate-output", "output")
                .depends_on("enrich-candidates")
                .with_input("candidates-enriched")
                .with_input("trip-context")
                .with_output("output-generated")
                .with_timeout(Duration::from_secs(5))
                .with_retries(1),
        )
        .with_step(
            Step::system("finalize", "finalize")
                .depends_on("generate-output")
                .with_input("output-generated")
                .with_output("trip-summary")
                .with_timeout(Duration::from_secs(5)),
        )
        .with_strategy(ErrorStrategy::RetryAndFallback)
        .with_fallback(BASIC_TEMPLATE)
        .with_compensation(CompensationAction::new(
            "enrich-candidates",
            "skip-enrichment",
            FailureCondition::Timeout,
        ))
        .with_sla(SlaSpec {
            max_duration: Duration::from_secs(300),
            warning_threshold: Duration::from_secs(120),
            critical_threshold: Duration::from_secs(240),
        })
        .build()
        .expect("travel template is statically valid")
}

/// The degraded pipeline: no ranking, no enrichment, relaxed candidate
/// minimums. Used when the full pipeline cannot make progress.
pub fn travel_planning_basic() -> Template {
    Template::builder(BASIC_TEMPLATE)
        .with_step(
            Step::system("initialize", "initialize")
                .with_timeout(Duration::from_secs(5))
                .with_output("trip-context"),
        )
        .with_step(
            Step::stage("generate-candidates", "candidate")
                .depends_on("initialize")
                .with_input("trip-context")
                .with_output("candidates-generated")
                .with_timeout(Duration::from_secs(10))
                .with_retries(1)
                .with_config(json!({"min_candidates": 2, "latency_ms": 5})),
        )
        .with_step(
            Step::stage("validate-candidates", "validation")
                .depends_on("generate-candidates")
                .with_input("candidates-generated")
                .with_input("trip-context")
                .with_output("candidates-validated")
                .with_timeout(Duration::from_secs(5))
                .with_retries(1)
                .with_config(json!({"min_rating": 1.5, "max_price_share": 0.8})),
        )
        .with_step(
            Step::stage("select-candidates", "selection")
                .depends_on("validate-candidates")
                .with_input("candidates-validated")
                .with_input("trip-context")
                .with_output("candidates-selected")
                .with_timeout(Duration::from_secs(5))
                .with_retries(1)
                .with_config(json!({"strategy": "budget-first", "source": "candidates-validated"})),
        )
        .with_step(
            Step::stage("generate-output", "output")
                .depends_on("select-candidates")
                .with_input("candidates-selected")
                .with_input("trip-context")
                .with_output("output-generated")
                .with_timeout(Duration::from_secs(5))
                .with_retries(1)
                .with_config(json!({"source": "candidates-selected"})),
        )
        .with_step(
            Step::system("finalize", "finalize")
                .depends_on("generate-output")
                .with_input("output-generated")
                .with_output("trip-summary")
                .with_timeout(Duration::from_secs(5)),
        )
        .with_strategy(ErrorStrategy::FailFast)
        .with_sla(SlaSpec {
            max_duration: Duration::from_secs(180),
            warning_threshold: Duration::from_secs(60),
            critical_threshold: Duration::from_secs(120),
        })
        .build()
        .expect("basic template is statically valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_travel_template_has_eight_steps() {
        let template = travel_planning();
        assert_eq!(template.steps.len(), 8);
        assert!(template.validate().is_ok());
        assert_eq!(
            template.error_handling.fallback_template.as_deref(),
            Some(BASIC_TEMPLATE)
        );
    }

    #[test]
    fn test_basic_template_validates() {
        let template = travel_planning_basic();
        assert!(template.validate().is_ok());
        assert!(template.steps.len() < travel_planning().steps.len());
        assert!(template.step("enrich-candidates").is_none());
    }

    #[test]
    fn test_enrichment_compensation_is_bound_to_timeout() {
        let template = travel_planning();
        let action = &template.error_handling.compensation_actions[0];
        assert_eq!(action.step, "enrich-candidates");
        assert_eq!(action.action, "skip-enrichment");
        assert!(action.applies_to("enrich-candidates", "timeout"));
        assert!(!action.applies_to("enrich-candidates", "payment declined"));
    }
}
