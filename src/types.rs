//! Core data model for the sizing control loop.
//!
//! All resource values are carried in canonical units: CPU in millicores,
//! memory in bytes. Conversion to and from Kubernetes quantity strings
//! happens at the API boundary (see [`crate::quantity`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one sized container: `(namespace, workload, container)`.
///
/// The workload is the owner (Deployment, StatefulSet, ...) rather than the
/// ephemeral pod, so samples survive pod churn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerKey {
    /// Namespace
    pub namespace: String,
    /// Owning workload name (falls back to the pod name when unowned)
    pub workload: String,
    /// Container name
    pub container: String,
}

impl ContainerKey {
    pub fn new(
        namespace: impl Into<String>,
        workload: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            workload: workload.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.workload, self.container)
    }
}

/// One observed usage point for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    /// Observation time
    pub timestamp: DateTime<Utc>,
    /// CPU usage in millicores
    pub cpu_millicores: u64,
    /// Memory usage in bytes
    pub memory_bytes: u64,
}

/// Per-resource statistics over a query window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelStats {
    pub mean: f64,
    pub stddev: f64,
    pub min: u64,
    pub max: u64,
}

/// Windowed statistics for both resource dimensions.
///
/// `insufficient` is set when the window holds fewer samples than the store's
/// minimum; callers treat that as a veto for predictive actions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageStats {
    pub count: usize,
    pub cpu: ChannelStats,
    pub memory: ChannelStats,
    pub insufficient: bool,
}

/// Percentile aggregate of a window, one value per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageAggregate {
    /// CPU percentile value in millicores
    pub cpu_millicores: u64,
    /// Memory percentile value in bytes
    pub memory_bytes: u64,
}

/// The four-tuple of request/limit pairs for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    /// CPU request in millicores
    pub cpu_request: u64,
    /// CPU limit in millicores
    pub cpu_limit: u64,
    /// Memory request in bytes
    pub memory_request: u64,
    /// Memory limit in bytes
    pub memory_limit: u64,
}

impl ResourceEnvelope {
    /// Checks the envelope invariants: strictly positive values and
    /// `request <= limit` on both dimensions.
    pub fn is_valid(&self) -> bool {
        self.cpu_request > 0
            && self.memory_request > 0
            && self.cpu_request <= self.cpu_limit
            && self.memory_request <= self.memory_limit
    }

    /// An instance is guaranteed when every resource has request == limit.
    pub fn is_guaranteed(&self) -> bool {
        self.cpu_request == self.cpu_limit && self.memory_request == self.memory_limit
    }

    /// Largest relative change across both dimensions versus `other`,
    /// measured on requests. Used to order commits (largest gain first).
    pub fn relative_change_from(&self, other: &ResourceEnvelope) -> f64 {
        let cpu = relative_delta(other.cpu_request, self.cpu_request);
        let mem = relative_delta(other.memory_request, self.memory_request);
        cpu.max(mem)
    }
}

fn relative_delta(from: u64, to: u64) -> f64 {
    if from == 0 {
        return if to == 0 { 0.0 } else { 1.0 };
    }
    ((to as f64) - (from as f64)).abs() / from as f64
}

/// Which dimensions a decision touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Noop,
    CpuOnly,
    MemOnly,
    Both,
}

impl DecisionAction {
    pub fn touches_cpu(&self) -> bool {
        matches!(self, DecisionAction::CpuOnly | DecisionAction::Both)
    }

    pub fn touches_memory(&self) -> bool {
        matches!(self, DecisionAction::MemOnly | DecisionAction::Both)
    }
}

/// Why the gate settled on its action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Proposal crossed a scale threshold
    ThresholdCrossed,
    /// Within both thresholds, nothing to do
    WithinThresholds,
    /// Last commit too recent
    Cooldown,
    /// Memory decrease dropped by the safety rule
    MemoryDecreaseSuppressed,
    /// Proposal would break the guaranteed QoS class
    QosPreserved,
    /// Calculator could not produce a feasible envelope
    Infeasible,
    /// No current usage evidence; downscale refused
    MissingUsage,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionReason::ThresholdCrossed => "threshold_crossed",
            DecisionReason::WithinThresholds => "within_thresholds",
            DecisionReason::Cooldown => "cooldown",
            DecisionReason::MemoryDecreaseSuppressed => "memory_decrease_suppressed",
            DecisionReason::QosPreserved => "qos_preserved",
            DecisionReason::Infeasible => "infeasible",
            DecisionReason::MissingUsage => "missing_usage",
        };
        f.write_str(s)
    }
}

/// A gated sizing decision for one container, ready for the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Container identity (workload-keyed)
    pub key: ContainerKey,
    /// Live pod carrying the container
    pub pod_name: String,
    /// Envelope currently on the container
    pub current: ResourceEnvelope,
    /// Envelope the executor should converge to
    pub desired: ResourceEnvelope,
    /// Dimensions to touch
    pub action: DecisionAction,
    /// Why
    pub reason: DecisionReason,
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn is_noop(&self) -> bool {
        self.action == DecisionAction::Noop
    }

    /// Ordering key for the per-sweep commit budget.
    pub fn magnitude(&self) -> f64 {
        self.desired.relative_change_from(&self.current)
    }
}

/// Structured outcome of one executor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResizeOutcome {
    /// CPU patch was applied (or already in the desired state)
    pub cpu_applied: bool,
    /// Memory patch was applied (or already in the desired state)
    pub mem_applied: bool,
    /// Terminal error, if the protocol failed
    pub error: Option<String>,
}

impl ResizeOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// View of one live container relevant to the sizing loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerView {
    pub name: String,
    /// Current envelope, if requests and limits are all set
    pub envelope: Option<ResourceEnvelope>,
    /// Container declares restart-free resize for both resources
    pub resize_policy_ok: bool,
}

/// View of one live workload instance (pod) relevant to the sizing loop.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadInstance {
    pub namespace: String,
    pub pod_name: String,
    /// Owner workload name (pod name when unowned)
    pub workload: String,
    /// Owner kind, e.g. Deployment
    pub workload_kind: Option<String>,
    pub labels: std::collections::BTreeMap<String, String>,
    pub containers: Vec<ContainerView>,
}

impl WorkloadInstance {
    /// Key for one of this instance's containers.
    pub fn container_key(&self, container: &str) -> ContainerKey {
        ContainerKey::new(&self.namespace, &self.workload, container)
    }

    /// Per-instance identity used by cooldown and backoff maps.
    pub fn instance_id(&self) -> String {
        format!("{}/{}", self.namespace, self.pod_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(cr: u64, cl: u64, mr: u64, ml: u64) -> ResourceEnvelope {
        ResourceEnvelope {
            cpu_request: cr,
            cpu_limit: cl,
            memory_request: mr,
            memory_limit: ml,
        }
    }

    #[test]
    fn test_envelope_validity() {
        assert!(env(100, 200, 1 << 20, 1 << 21).is_valid());
        assert!(!env(0, 200, 1 << 20, 1 << 21).is_valid());
        assert!(!env(300, 200, 1 << 20, 1 << 21).is_valid());
        assert!(!env(100, 200, 1 << 21, 1 << 20).is_valid());
    }

    #[test]
    fn test_guaranteed_classification() {
        assert!(env(100, 100, 1 << 20, 1 << 20).is_guaranteed());
        assert!(!env(100, 200, 1 << 20, 1 << 20).is_guaranteed());
    }

    #[test]
    fn test_relative_change_picks_larger_dimension() {
        let from = env(100, 200, 1000, 2000);
        let to = env(110, 200, 1500, 2000);
        // CPU moved 10%, memory moved 50%
        let change = to.relative_change_from(&from);
        assert!((change - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_action_dimensions() {
        assert!(DecisionAction::Both.touches_cpu());
        assert!(DecisionAction::Both.touches_memory());
        assert!(DecisionAction::CpuOnly.touches_cpu());
        assert!(!DecisionAction::CpuOnly.touches_memory());
        assert!(!DecisionAction::Noop.touches_cpu());
    }
}
