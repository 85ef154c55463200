//! Sizing policy model and the per-instance policy resolver.
//!
//! Policies arrive as declarative objects from the configuration source.
//! Resolution picks the single effective policy for a workload instance:
//! filter by selector match, sort by priority descending, break ties by
//! lexicographic name. Conflicting fields are never merged across policies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::WorkloadInstance;

/// What the loop is allowed to do under a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Compute decisions, log nothing but summaries, never commit
    Observe,
    /// Compute and log decisions as advice, never commit
    Advise,
    /// Commit decisions through the executor
    Enforce,
}

/// Per-resource scaling formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceFormula {
    /// Multiplier applied to the usage aggregate
    pub multiplier: f64,
    /// Flat addition on top of the multiplied usage (canonical units)
    pub addition: u64,
    /// Limit = request * limitMultiplier + limitAddition
    pub limit_multiplier: f64,
    pub limit_addition: u64,
    /// Request bounds (canonical units)
    pub min_request: u64,
    pub max_request: u64,
    /// Upper bound for the derived limit
    pub max_limit: u64,
}

impl ResourceFormula {
    /// Default CPU formula: 20% headroom, burst limit at 2x request.
    pub fn default_cpu() -> Self {
        Self {
            multiplier: 1.2,
            addition: 0,
            limit_multiplier: 2.0,
            limit_addition: 0,
            min_request: 10,
            max_request: 16_000,
            max_limit: 32_000,
        }
    }

    /// Default memory formula: 20% headroom, limit pinned to request so a
    /// resize never widens the OOM window.
    pub fn default_memory() -> Self {
        Self {
            multiplier: 1.2,
            addition: 0,
            limit_multiplier: 1.0,
            limit_addition: 0,
            min_request: 32 * crate::quantity::MIB,
            max_request: 64 * 1024 * crate::quantity::MIB,
            max_limit: 64 * 1024 * crate::quantity::MIB,
        }
    }
}

impl Default for ResourceFormula {
    fn default() -> Self {
        Self::default_cpu()
    }
}

/// Aggregation and scaling strategy of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SizingStrategy {
    pub cpu: ResourceFormula,
    pub memory: ResourceFormula,
    /// Aggregation window over the sample store
    pub window_seconds: u64,
    /// Percentile of the window used as the usage aggregate (0, 1]
    pub percentile: f64,
}

impl SizingStrategy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

impl Default for SizingStrategy {
    fn default() -> Self {
        Self {
            cpu: ResourceFormula::default_cpu(),
            memory: ResourceFormula::default_memory(),
            window_seconds: 600,
            percentile: 0.95,
        }
    }
}

/// Safety constraints of a policy, consumed by the decision gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConstraints {
    /// Per-instance interval (seconds) after a commit during which further
    /// commits are vetoed
    #[serde(rename = "cooldown")]
    pub cooldown_seconds: u64,
    /// Maximum fraction a dimension may move in one step (0 disables)
    pub max_change_per_step: f64,
    /// Permit live memory shrink (conservative default: off)
    pub allow_memory_decrease: bool,
    /// Proposal must exceed current by this fraction to scale up
    pub scale_up_threshold: f64,
    /// Proposal must undercut current by this fraction to scale down
    pub scale_down_threshold: f64,
}

impl PolicyConstraints {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

impl Default for PolicyConstraints {
    fn default() -> Self {
        Self {
            cooldown_seconds: 300,
            max_change_per_step: 0.5,
            allow_memory_decrease: false,
            scale_up_threshold: 0.15,
            scale_down_threshold: 0.15,
        }
    }
}

/// Namespace and label predicates selecting the instances a policy covers.
///
/// Semantics: namespace must be in the include list (empty = all), must not
/// be in the exclude list, and every label predicate must hold (conjunction).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicySelector {
    pub namespace_include: Vec<String>,
    pub namespace_exclude: Vec<String>,
    pub match_labels: BTreeMap<String, String>,
}

impl PolicySelector {
    pub fn matches(&self, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
        if !self.namespace_include.is_empty()
            && !self.namespace_include.iter().any(|n| n == namespace)
        {
            return false;
        }
        if self.namespace_exclude.iter().any(|n| n == namespace) {
            return false;
        }
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
    }
}

/// One declarative sizing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub name: String,
    /// Non-negative priority; higher wins
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub selector: PolicySelector,
    pub mode: PolicyMode,
    #[serde(default)]
    pub strategy: SizingStrategy,
    #[serde(default)]
    pub constraints: PolicyConstraints,
}

/// The unique policy resolved for one workload instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    /// Source policy name, or "default" for the built-in fallback
    pub name: String,
    pub mode: PolicyMode,
    pub strategy: SizingStrategy,
    pub constraints: PolicyConstraints,
}

struct ResolverState {
    /// Sorted: priority descending, then name ascending
    policies: Vec<Arc<Policy>>,
    default_policy: Arc<EffectivePolicy>,
    generation: u64,
}

/// Resolves the effective policy for workload instances, caching per instance
/// until the policy set generation advances (config reload).
pub struct PolicyResolver {
    state: ArcSwap<ResolverState>,
    cache: DashMap<String, (u64, Arc<EffectivePolicy>)>,
}

impl PolicyResolver {
    pub fn new(
        policies: Vec<Policy>,
        default_strategy: SizingStrategy,
        default_constraints: PolicyConstraints,
        default_mode: PolicyMode,
        generation: u64,
    ) -> Self {
        let state = Self::build_state(
            policies,
            default_strategy,
            default_constraints,
            default_mode,
            generation,
        );
        Self {
            state: ArcSwap::from_pointee(state),
            cache: DashMap::new(),
        }
    }

    /// Replace the active policy set. Stale cache entries are discarded
    /// lazily on the next resolve of each instance.
    pub fn reload(
        &self,
        policies: Vec<Policy>,
        default_strategy: SizingStrategy,
        default_constraints: PolicyConstraints,
        default_mode: PolicyMode,
        generation: u64,
    ) {
        let state = Self::build_state(
            policies,
            default_strategy,
            default_constraints,
            default_mode,
            generation,
        );
        self.state.store(Arc::new(state));
    }

    fn build_state(
        mut policies: Vec<Policy>,
        default_strategy: SizingStrategy,
        default_constraints: PolicyConstraints,
        default_mode: PolicyMode,
        generation: u64,
    ) -> ResolverState {
        policies.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        ResolverState {
            policies: policies.into_iter().map(Arc::new).collect(),
            default_policy: Arc::new(EffectivePolicy {
                name: "default".to_string(),
                mode: default_mode,
                strategy: default_strategy,
                constraints: default_constraints,
            }),
            generation,
        }
    }

    /// Current policy set generation.
    pub fn generation(&self) -> u64 {
        self.state.load().generation
    }

    /// Resolve the single effective policy for an instance.
    pub fn resolve(&self, instance: &WorkloadInstance) -> Arc<EffectivePolicy> {
        let state = self.state.load();
        let id = instance.instance_id();

        if let Some(entry) = self.cache.get(&id) {
            let (generation, effective) = entry.value();
            if *generation == state.generation {
                return effective.clone();
            }
        }

        let effective = self.resolve_uncached(&state, instance);
        self.cache
            .insert(id, (state.generation, effective.clone()));
        effective
    }

    fn resolve_uncached(
        &self,
        state: &ResolverState,
        instance: &WorkloadInstance,
    ) -> Arc<EffectivePolicy> {
        let candidates: Vec<&Arc<Policy>> = state
            .policies
            .iter()
            .filter(|p| p.selector.matches(&instance.namespace, &instance.labels))
            .collect();

        let Some(winner) = candidates.first() else {
            return state.default_policy.clone();
        };

        // Fields are never merged across tied policies; name every loser so
        // the conflict is visible.
        let tied: Vec<&str> = candidates[1..]
            .iter()
            .take_while(|p| p.priority == winner.priority)
            .map(|p| p.name.as_str())
            .collect();
        if !tied.is_empty() {
            log::warn!(
                "policies [{}] share priority {} with '{}' on {}; keeping '{}'",
                tied.join(", "),
                winner.priority,
                winner.name,
                instance.instance_id(),
                winner.name
            );
        }

        Arc::new(EffectivePolicy {
            name: winner.name.clone(),
            mode: winner.mode,
            strategy: winner.strategy,
            constraints: winner.constraints,
        })
    }

    /// Drop cached resolutions for instances that disappeared.
    pub fn evict(&self, instance_id: &str) {
        self.cache.remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(namespace: &str, labels: &[(&str, &str)]) -> WorkloadInstance {
        WorkloadInstance {
            namespace: namespace.to_string(),
            pod_name: "pod-0".to_string(),
            workload: "app".to_string(),
            workload_kind: Some("Deployment".to_string()),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            containers: vec![],
        }
    }

    fn policy(name: &str, priority: u32, selector: PolicySelector) -> Policy {
        Policy {
            name: name.to_string(),
            priority,
            selector,
            mode: PolicyMode::Enforce,
            strategy: SizingStrategy::default(),
            constraints: PolicyConstraints::default(),
        }
    }

    fn resolver(policies: Vec<Policy>) -> PolicyResolver {
        PolicyResolver::new(
            policies,
            SizingStrategy::default(),
            PolicyConstraints::default(),
            PolicyMode::Advise,
            1,
        )
    }

    #[test]
    fn test_selector_namespace_semantics() {
        let sel = PolicySelector {
            namespace_include: vec!["prod".to_string()],
            namespace_exclude: vec!["prod-canary".to_string()],
            match_labels: BTreeMap::new(),
        };
        assert!(sel.matches("prod", &BTreeMap::new()));
        assert!(!sel.matches("staging", &BTreeMap::new()));

        let sel = PolicySelector {
            namespace_exclude: vec!["staging".to_string()],
            ..Default::default()
        };
        assert!(sel.matches("prod", &BTreeMap::new()));
        assert!(!sel.matches("staging", &BTreeMap::new()));
    }

    #[test]
    fn test_selector_label_conjunction() {
        let sel = PolicySelector {
            match_labels: [("app", "web"), ("tier", "frontend")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        let both: BTreeMap<String, String> = [("app", "web"), ("tier", "frontend"), ("x", "y")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let one: BTreeMap<String, String> = [("app", "web")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(sel.matches("any", &both));
        assert!(!sel.matches("any", &one));
    }

    #[test]
    fn test_priority_descending_wins() {
        let r = resolver(vec![
            policy("low", 1, PolicySelector::default()),
            policy("high", 9, PolicySelector::default()),
        ]);
        let effective = r.resolve(&instance("prod", &[]));
        assert_eq!(effective.name, "high");
    }

    #[test]
    fn test_tie_break_by_name_is_deterministic() {
        for _ in 0..10 {
            let r = resolver(vec![
                policy("zeta", 5, PolicySelector::default()),
                policy("alpha", 5, PolicySelector::default()),
            ]);
            let effective = r.resolve(&instance("prod", &[]));
            assert_eq!(effective.name, "alpha");
        }
    }

    #[test]
    fn test_three_way_tie_keeps_first_by_name() {
        let r = resolver(vec![
            policy("mid", 5, PolicySelector::default()),
            policy("zeta", 5, PolicySelector::default()),
            policy("alpha", 5, PolicySelector::default()),
            policy("low", 1, PolicySelector::default()),
        ]);
        let effective = r.resolve(&instance("prod", &[]));
        assert_eq!(effective.name, "alpha");
    }

    #[test]
    fn test_no_match_falls_back_to_default() {
        let sel = PolicySelector {
            namespace_include: vec!["other".to_string()],
            ..Default::default()
        };
        let r = resolver(vec![policy("scoped", 5, sel)]);
        let effective = r.resolve(&instance("prod", &[]));
        assert_eq!(effective.name, "default");
        assert_eq!(effective.mode, PolicyMode::Advise);
    }

    #[test]
    fn test_cache_invalidated_on_generation_advance() {
        let r = resolver(vec![policy("first", 5, PolicySelector::default())]);
        let inst = instance("prod", &[]);
        assert_eq!(r.resolve(&inst).name, "first");

        r.reload(
            vec![policy("second", 5, PolicySelector::default())],
            SizingStrategy::default(),
            PolicyConstraints::default(),
            PolicyMode::Advise,
            2,
        );
        assert_eq!(r.resolve(&inst).name, "second");
    }

    #[test]
    fn test_policy_yaml_roundtrip_defaults() {
        let yaml = r#"
name: web-workloads
priority: 10
mode: enforce
selector:
  namespaceInclude: [prod]
  matchLabels:
    app: web
"#;
        let p: Policy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.name, "web-workloads");
        assert_eq!(p.priority, 10);
        assert_eq!(p.mode, PolicyMode::Enforce);
        // Unspecified sections take compiled defaults
        assert!((p.strategy.percentile - 0.95).abs() < 1e-9);
        assert_eq!(p.constraints.cooldown_seconds, 300);
    }
}
