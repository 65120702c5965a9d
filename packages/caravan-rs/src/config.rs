//! Immutable runtime configuration.
//!
//! Config objects are constructed once at admission and passed by
//! reference; there is no process-wide mutable state. Builders follow
//! the `with_*` convention.

use std::time::Duration;

use crate::namespace::Namespace;
use crate::pattern::wildcard_match;

/// Configuration for the workflow engine and its supervisor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on concurrently running sagas; `start()` refuses above it.
    pub max_concurrent_workflows: usize,
    /// Base delay for retry backoff (`min(base * 2^n, cap)`).
    pub retry_backoff_base: Duration,
    /// Ceiling for retry backoff.
    pub retry_backoff_cap: Duration,
    /// Timeout applied to steps that declare none.
    pub default_step_timeout: Duration,
    /// How often the supervisor evaluates SLA thresholds.
    pub sla_check_interval: Duration,
    /// How often terminal sagas are swept.
    pub cleanup_interval: Duration,
    /// Terminal sagas older than this are garbage-collected.
    pub max_workflow_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 100,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_cap: Duration::from_secs(30),
            default_step_timeout: Duration::from_secs(30),
            sla_check_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            max_workflow_age: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent_workflows = n;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.retry_backoff_base = base;
        self.retry_backoff_cap = cap;
        self
    }

    pub fn with_sla_check_interval(mut self, interval: Duration) -> Self {
        self.sla_check_interval = interval;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_max_workflow_age(mut self, age: Duration) -> Self {
        self.max_workflow_age = age;
        self
    }

    /// Backoff before the (retry_count + 1)-th attempt:
    /// `min(base * 2^retry_count, cap)`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(16));
        self.retry_backoff_base
            .saturating_mul(factor)
            .min(self.retry_backoff_cap)
    }
}

/// A default-TTL rule: entries written under `namespace` whose key
/// matches `key_pattern` expire after `ttl` unless the writer supplied
/// an explicit TTL.
#[derive(Debug, Clone)]
pub struct TtlRule {
    pub namespace: Namespace,
    pub key_pattern: String,
    pub ttl: Duration,
}

impl TtlRule {
    pub fn new(namespace: Namespace, key_pattern: impl Into<String>, ttl: Duration) -> Self {
        Self {
            namespace,
            key_pattern: key_pattern.into(),
            ttl,
        }
    }
}

/// An invalidation rule: when a `state-invalidate` event's reason
/// matches `reason_pattern`, delete every key under `namespace`
/// matching `key_pattern`.
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    pub reason_pattern: String,
    pub namespace: Namespace,
    pub key_pattern: String,
}

impl InvalidationRule {
    pub fn new(
        reason_pattern: impl Into<String>,
        namespace: Namespace,
        key_pattern: impl Into<String>,
    ) -> Self {
        Self {
            reason_pattern: reason_pattern.into(),
            namespace,
            key_pattern: key_pattern.into(),
        }
    }

    pub fn matches_reason(&self, reason: &str) -> bool {
        wildcard_match(&self.reason_pattern, reason)
    }
}

/// Configuration for the blackboard.
#[derive(Debug, Clone)]
pub struct BlackboardConfig {
    /// Default TTL rules, first match wins in declaration order.
    pub ttl_rules: Vec<TtlRule>,
    /// Reason-matched invalidation rules.
    pub invalidation_rules: Vec<InvalidationRule>,
    /// Interval of the periodic expiry sweeper.
    pub sweep_interval: Duration,
}

impl Default for BlackboardConfig {
    fn default() -> Self {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 3600;
        Self {
            // Category-specific rules precede the namespace-wide
            // fallbacks: first match wins.
            ttl_rules: vec![
                TtlRule::new(Namespace::Candidates, "flights*", Duration::from_secs(5 * MINUTE)),
                TtlRule::new(Namespace::Candidates, "hotels*", Duration::from_secs(30 * MINUTE)),
                TtlRule::new(Namespace::Candidates, "activities*", Duration::from_secs(24 * HOUR)),
                TtlRule::new(Namespace::Candidates, "restaurants*", Duration::from_secs(24 * HOUR)),
                TtlRule::new(Namespace::Candidates, "cars*", Duration::from_secs(12 * HOUR)),
                TtlRule::new(Namespace::Candidates, "*", Duration::from_secs(5 * MINUTE)),
                TtlRule::new(Namespace::Selections, "*", Duration::from_secs(30 * MINUTE)),
                TtlRule::new(Namespace::Media, "*", Duration::from_secs(24 * HOUR)),
                TtlRule::new(Namespace::Cache, "*", Duration::from_secs(HOUR)),
            ],
            invalidation_rules: Vec::new(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl BlackboardConfig {
    /// Empty configuration: no default TTLs, no invalidation rules.
    pub fn bare() -> Self {
        Self {
            ttl_rules: Vec::new(),
            invalidation_rules: Vec::new(),
            sweep_interval: Duration::from_secs(60),
        }
    }

    pub fn with_ttl_rule(mut self, rule: TtlRule) -> Self {
        self.ttl_rules.push(rule);
        self
    }

    pub fn with_invalidation_rule(mut self, rule: InvalidationRule) -> Self {
        self.invalidation_rules.push(rule);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Resolve the default TTL for a `(namespace, key)` pair, if any.
    pub fn default_ttl(&self, namespace: Namespace, key: &str) -> Option<Duration> {
        self.ttl_rules
            .iter()
            .find(|rule| rule.namespace == namespace && wildcard_match(&rule.key_pattern, key))
            .map(|rule| rule.ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff_for(0), Duration::from_secs(1));
        assert_eq!(config.backoff_for(1), Duration::from_secs(2));
        assert_eq!(config.backoff_for(3), Duration::from_secs(8));
        // 2^6 = 64s caps at 30s.
        assert_eq!(config.backoff_for(6), Duration::from_secs(30));
        // Huge retry counts must not overflow.
        assert_eq!(config.backoff_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_default_ttl_first_match_wins() {
        let config = BlackboardConfig::default();
        assert_eq!(
            config.default_ttl(Namespace::Candidates, "flights:jfk-lax"),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            config.default_ttl(Namespace::Candidates, "hotels:nyc"),
            Some(Duration::from_secs(1800))
        );
        // Unmatched category falls through to the namespace-wide rule.
        assert_eq!(
            config.default_ttl(Namespace::Candidates, "misc"),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_default_ttl_absent_rule_means_no_expiry() {
        let config = BlackboardConfig::default();
        assert_eq!(config.default_ttl(Namespace::Audit, "anything"), None);
        assert_eq!(config.default_ttl(Namespace::UserInput, "req"), None);
    }

    #[test]
    fn test_invalidation_rule_reason_matching() {
        let rule = InvalidationRule::new("price drift*", Namespace::Candidates, "*");
        assert!(rule.matches_reason("price drift>10%"));
        assert!(!rule.matches_reason("reverify>10m"));
    }
}
