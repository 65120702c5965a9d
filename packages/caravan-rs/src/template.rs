//! Declarative workflow templates.
//!
//! A [`Template`] is immutable at runtime: an ordered list of steps with
//! dependencies, timeouts, retry budgets, input/output wiring, an
//! error-handling strategy with compensation actions, and SLA
//! thresholds. Templates are validated at registration; a saga never
//! runs against an invalid template.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

/// How a step is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// In-process handler registered by target name.
    System,
    /// Pipeline stage participant reached over the bus.
    Stage,
    /// Named external service participant; dispatch mechanics are
    /// identical to `Stage`, the distinction is operational.
    External,
}

/// One node in a template's DAG.
#[derive(Debug, Clone)]
pub struct Step {
    /// Step id, unique within the template.
    pub id: String,
    pub kind: StepKind,
    /// Handler name (system) or stage/service name (stage, external).
    pub target: String,
    /// Budget for one attempt of this step.
    pub timeout: Duration,
    /// Number of retries after the first failed attempt.
    pub retries: u32,
    /// Step ids that must complete before this step may run.
    pub depends_on: Vec<String>,
    /// Output keys of earlier steps resolved into the request envelope.
    pub inputs: Vec<String>,
    /// Keys under which this step's results are stored.
    pub outputs: Vec<String>,
    /// Opaque per-step configuration forwarded to the participant.
    pub config: Value,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            target: target.into(),
            timeout: Duration::from_secs(30),
            retries: 0,
            depends_on: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            config: Value::Null,
        }
    }

    pub fn system(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, StepKind::System, target)
    }

    pub fn stage(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, StepKind::Stage, target)
    }

    pub fn external(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, StepKind::External, target)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>) -> Self {
        self.inputs.push(key.into());
        self
    }

    pub fn with_output(mut self, key: impl Into<String>) -> Self {
        self.outputs.push(key.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Failure condition a compensation action is bound to.
///
/// Matched against the failure reason string recorded for the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCondition {
    Timeout,
    ServiceUnavailable,
    PaymentFailed,
    BookingFailed,
    Any,
}

impl FailureCondition {
    /// Whether this condition matches a recorded failure reason.
    pub fn matches(&self, reason: &str) -> bool {
        match self {
            FailureCondition::Any => true,
            FailureCondition::Timeout => reason.contains("timeout") || reason.contains("timed out"),
            FailureCondition::ServiceUnavailable => reason.contains("unavailable"),
            FailureCondition::PaymentFailed => reason.contains("payment"),
            FailureCondition::BookingFailed => reason.contains("booking"),
        }
    }
}

/// A corrective action bound to one step and one failure condition.
#[derive(Debug, Clone)]
pub struct CompensationAction {
    /// The step this action compensates.
    pub step: String,
    /// Name of a registered compensation handler.
    pub action: String,
    pub condition: FailureCondition,
}

impl CompensationAction {
    pub fn new(
        step: impl Into<String>,
        action: impl Into<String>,
        condition: FailureCondition,
    ) -> Self {
        Self {
            step: step.into(),
            action: action.into(),
            condition,
        }
    }

    /// Whether this action applies to a given failed step and reason.
    pub fn applies_to(&self, step_id: &str, reason: &str) -> bool {
        self.step == step_id && self.condition.matches(reason)
    }
}

/// What the engine does once a step permanently fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorStrategy {
    /// Mark the saga failed; no compensation.
    FailFast,
    /// Try a matching compensation, then the fallback template, then fail.
    RetryAndFallback,
    /// Run every matching compensation in declaration order, then fail.
    Compensate,
}

/// Error handling section of a template.
#[derive(Debug, Clone)]
pub struct ErrorHandling {
    pub strategy: ErrorStrategy,
    pub fallback_template: Option<String>,
    pub compensation_actions: Vec<CompensationAction>,
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::FailFast,
            fallback_template: None,
            compensation_actions: Vec::new(),
        }
    }
}

/// SLA thresholds for a running saga.
#[derive(Debug, Clone, Copy)]
pub struct SlaSpec {
    pub max_duration: Duration,
    pub warning_threshold: Duration,
    pub critical_threshold: Duration,
}

impl Default for SlaSpec {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(300),
            warning_threshold: Duration::from_secs(120),
            critical_threshold: Duration::from_secs(240),
        }
    }
}

/// An immutable workflow definition.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub steps: Vec<Step>,
    pub error_handling: ErrorHandling,
    pub sla: SlaSpec,
}

impl Template {
    pub fn builder(name: impl Into<String>) -> TemplateBuilder {
        TemplateBuilder {
            name: name.into(),
            steps: Vec::new(),
            error_handling: ErrorHandling::default(),
            sla: SlaSpec::default(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Validate the template invariants:
    ///
    /// - step ids are unique
    /// - every dependency names a step in this template
    /// - the dependency graph is a DAG
    /// - every declared input key is an output of some earlier step
    pub fn validate(&self) -> EngineResult<()> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(EngineError::DependencyViolation(format!(
                    "template {}: duplicate step id {}",
                    self.name, step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(EngineError::DependencyViolation(format!(
                        "template {}: step {} depends on unknown step {}",
                        self.name, step.id, dep
                    )));
                }
            }
        }

        self.check_acyclic()?;

        let mut produced: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            for input in &step.inputs {
                if !produced.contains(input.as_str()) {
                    return Err(EngineError::DependencyViolation(format!(
                        "template {}: step {} consumes {} which no earlier step produces",
                        self.name, step.id, input
                    )));
                }
            }
            produced.extend(step.outputs.iter().map(String::as_str));
        }

        Ok(())
    }

    fn check_acyclic(&self) -> EngineResult<()> {
        // Kahn's algorithm over the dependency edges.
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let d = index[dep.as_str()];
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = ready.pop() {
            visited += 1;
            for &next in &dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(next);
                }
            }
        }

        if visited != self.steps.len() {
            return Err(EngineError::DependencyViolation(format!(
                "template {}: dependency graph contains a cycle",
                self.name
            )));
        }
        Ok(())
    }
}

/// Builder for [`Template`].
pub struct TemplateBuilder {
    name: String,
    steps: Vec<Step>,
    error_handling: ErrorHandling,
    sla: SlaSpec,
}

impl TemplateBuilder {
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_handling.strategy = strategy;
        self
    }

    pub fn with_fallback(mut self, template: impl Into<String>) -> Self {
        self.error_handling.fallback_template = Some(template.into());
        self
    }

    pub fn with_compensation(mut self, action: CompensationAction) -> Self {
        self.error_handling.compensation_actions.push(action);
        self
    }

    pub fn with_sla(mut self, sla: SlaSpec) -> Self {
        self.sla = sla;
        self
    }

    /// Finish and validate.
    pub fn build(self) -> EngineResult<Template> {
        let template = Template {
            name: self.name,
            steps: self.steps,
            error_handling: self.error_handling,
            sla: self.sla,
        };
        template.validate()?;
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step() -> TemplateBuilder {
        Template::builder("t")
            .with_step(Step::system("a", "init").with_output("seed"))
            .with_step(Step::stage("b", "work").depends_on("a").with_input("seed"))
    }

    #[test]
    fn test_valid_template_builds() {
        let template = two_step().build().unwrap();
        assert_eq!(template.steps.len(), 2);
        assert!(template.step("b").is_some());
        assert!(template.step("zzz").is_none());
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let err = Template::builder("t")
            .with_step(Step::system("a", "x"))
            .with_step(Step::system("a", "y"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::DependencyViolation(_)));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = Template::builder("t")
            .with_step(Step::system("a", "x").depends_on("ghost"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = Template::builder("t")
            .with_step(Step::system("a", "x").depends_on("b"))
            .with_step(Step::system("b", "y").depends_on("a"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_input_must_be_produced_earlier() {
        let err = Template::builder("t")
            .with_step(Step::stage("a", "x").with_input("never-made"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("never-made"));
    }

    #[test]
    fn test_failure_condition_matching() {
        assert!(FailureCondition::Timeout.matches("timeout"));
        assert!(FailureCondition::Timeout.matches("step timed out after 5s"));
        assert!(FailureCondition::ServiceUnavailable.matches("weather service-unavailable"));
        assert!(FailureCondition::PaymentFailed.matches("payment declined"));
        assert!(FailureCondition::BookingFailed.matches("booking rejected"));
        assert!(FailureCondition::Any.matches("whatever"));
        assert!(!FailureCondition::Timeout.matches("service-unavailable"));
    }

    #[test]
    fn test_compensation_applies_to_step_and_reason() {
        let action = CompensationAction::new("enrich", "skip-enrichment", FailureCondition::Timeout);
        assert!(action.applies_to("enrich", "timeout"));
        assert!(!action.applies_to("enrich", "payment declined"));
        assert!(!action.applies_to("other", "timeout"));
    }
}
