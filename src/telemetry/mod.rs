//! Operator observability: Prometheus metric set and structured events.
//!
//! Registration is guarded behind lazily-initialised statics so repeated
//! initialisation is idempotent. Cluster identity labels are read once at
//! startup and attached as const labels to every family.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;

use crate::config::ClusterIdentity;
use crate::types::Decision;

static IDENTITY: OnceCell<ClusterIdentity> = OnceCell::new();

fn const_labels() -> HashMap<String, String> {
    let identity = IDENTITY.get_or_init(ClusterIdentity::from_env);
    HashMap::from([
        ("cluster_id".to_string(), identity.cluster_id.clone()),
        ("cluster_name".to_string(), identity.cluster_name.clone()),
        ("environment".to_string(), identity.environment.clone()),
        (
            "operator_version".to_string(),
            identity.operator_version.clone(),
        ),
    ])
}

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static COMMITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("rightsizer_commits_total", "Resize commits by outcome")
            .const_labels(const_labels()),
        &["outcome"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("rightsizer_decisions_total", "Gated decisions by action")
            .const_labels(const_labels()),
        &["action"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "rightsizer_failures_total",
            "Per-instance failures by error category",
        )
        .const_labels(const_labels()),
        &["category"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("rightsizer_events_total", "Structured events by kind")
            .const_labels(const_labels()),
        &["event"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static SWEEP_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "rightsizer_sweep_duration_seconds",
            "Wall time of one reconcile sweep",
        )
        .const_labels(const_labels()),
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

static SWEEP_INSTANCES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(
        Opts::new(
            "rightsizer_sweep_instances",
            "Instances considered in the last sweep",
        )
        .const_labels(const_labels()),
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static ENVELOPE_DELTA: Lazy<GaugeVec> = Lazy::new(|| {
    let g = GaugeVec::new(
        Opts::new(
            "rightsizer_envelope_delta_ratio",
            "Relative request change of the last committed decision",
        )
        .const_labels(const_labels()),
        &["namespace", "workload", "container", "resource"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/// Force-register the whole metric set. Safe to call more than once.
pub fn init(identity: &ClusterIdentity) {
    let _ = IDENTITY.set(identity.clone());
    Lazy::force(&COMMITS_TOTAL);
    Lazy::force(&DECISIONS_TOTAL);
    Lazy::force(&FAILURES_TOTAL);
    Lazy::force(&EVENTS_TOTAL);
    Lazy::force(&SWEEP_DURATION);
    Lazy::force(&SWEEP_INSTANCES);
    Lazy::force(&ENVELOPE_DELTA);
}

/// Structured operator events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorEvent {
    ResizeAttempted,
    ResizeSucceeded,
    ResizeSkippedNoop,
    ResizeDeniedCooldown,
    ResizeFailed,
}

impl OperatorEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorEvent::ResizeAttempted => "ResizeAttempted",
            OperatorEvent::ResizeSucceeded => "ResizeSucceeded",
            OperatorEvent::ResizeSkippedNoop => "ResizeSkippedNoop",
            OperatorEvent::ResizeDeniedCooldown => "ResizeDeniedCooldown",
            OperatorEvent::ResizeFailed => "ResizeFailed",
        }
    }

    fn event_type(&self) -> EventType {
        match self {
            OperatorEvent::ResizeFailed => EventType::Warning,
            _ => EventType::Normal,
        }
    }
}

/// Count a decision by its action label.
pub fn record_decision(decision: &Decision) {
    DECISIONS_TOTAL
        .with_label_values(&[match decision.action {
            crate::types::DecisionAction::Noop => "noop",
            crate::types::DecisionAction::CpuOnly => "cpu_only",
            crate::types::DecisionAction::MemOnly => "mem_only",
            crate::types::DecisionAction::Both => "both",
        }])
        .inc();
}

/// Count a commit by outcome and expose its envelope delta.
pub fn record_commit(decision: &Decision, succeeded: bool) {
    COMMITS_TOTAL
        .with_label_values(&[if succeeded { "succeeded" } else { "failed" }])
        .inc();
    if succeeded {
        let cpu_delta = ratio(decision.current.cpu_request, decision.desired.cpu_request);
        let mem_delta = ratio(
            decision.current.memory_request,
            decision.desired.memory_request,
        );
        ENVELOPE_DELTA
            .with_label_values(&[
                &decision.key.namespace,
                &decision.key.workload,
                &decision.key.container,
                "cpu",
            ])
            .set(cpu_delta);
        ENVELOPE_DELTA
            .with_label_values(&[
                &decision.key.namespace,
                &decision.key.workload,
                &decision.key.container,
                "memory",
            ])
            .set(mem_delta);
    }
}

fn ratio(from: u64, to: u64) -> f64 {
    if from == 0 {
        0.0
    } else {
        (to as f64 - from as f64) / from as f64
    }
}

/// Count a classified per-instance failure.
pub fn record_failure(category: crate::error::ErrorCategory) {
    FAILURES_TOTAL.with_label_values(&[category.as_str()]).inc();
}

/// Record one sweep's shape.
pub fn record_sweep(instances: usize, duration: std::time::Duration) {
    SWEEP_INSTANCES.set(instances as i64);
    SWEEP_DURATION.observe(duration.as_secs_f64());
}

/// Count an event occurrence; cluster-visible publication is the emitter's
/// business.
pub fn count_event(event: OperatorEvent) {
    EVENTS_TOTAL.with_label_values(&[event.as_str()]).inc();
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Publishes structured events to the cluster when a client is available.
pub struct EventEmitter {
    recorder: Option<Recorder>,
}

impl EventEmitter {
    /// Emitter backed by the cluster events API.
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: "rightsizer".to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            recorder: Some(Recorder::new(client, reporter)),
        }
    }

    /// Metrics-only emitter for tests and observe-only runs.
    pub fn disconnected() -> Self {
        Self { recorder: None }
    }

    /// Emit one event against a pod. Counting always happens; publication is
    /// best-effort.
    pub async fn emit(&self, event: OperatorEvent, decision: &Decision, note: String) {
        count_event(event);

        let Some(recorder) = &self.recorder else {
            return;
        };
        let reference = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Pod".to_string()),
            name: Some(decision.pod_name.clone()),
            namespace: Some(decision.key.namespace.clone()),
            ..Default::default()
        };
        let result = recorder
            .publish(
                &Event {
                    type_: event.event_type(),
                    reason: event.as_str().to_string(),
                    note: Some(note),
                    action: "Resize".to_string(),
                    secondary: None,
                },
                &reference,
            )
            .await;
        if let Err(e) = result {
            log::debug!("event publication failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContainerKey, DecisionAction, DecisionReason, ResourceEnvelope};
    use chrono::Utc;

    fn identity() -> ClusterIdentity {
        ClusterIdentity {
            cluster_id: "c-1".to_string(),
            cluster_name: "test".to_string(),
            environment: "ci".to_string(),
            operator_version: "0.0.0".to_string(),
        }
    }

    fn decision() -> Decision {
        Decision {
            key: ContainerKey::new("prod", "web", "app"),
            pod_name: "web-0".to_string(),
            current: ResourceEnvelope {
                cpu_request: 100,
                cpu_limit: 200,
                memory_request: 256,
                memory_limit: 256,
            },
            desired: ResourceEnvelope {
                cpu_request: 150,
                cpu_limit: 300,
                memory_request: 256,
                memory_limit: 256,
            },
            action: DecisionAction::CpuOnly,
            reason: DecisionReason::ThresholdCrossed,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        init(&identity());
        init(&identity());
        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"rightsizer_commits_total"));
        assert!(names.contains(&"rightsizer_sweep_duration_seconds"));
    }

    #[test]
    fn test_commit_outcome_and_delta_recorded() {
        init(&identity());
        record_commit(&decision(), true);
        let exposition = gather();
        assert!(exposition.contains("rightsizer_commits_total"));
        assert!(exposition.contains("rightsizer_envelope_delta_ratio"));
        assert!(exposition.contains("outcome=\"succeeded\""));
    }

    #[test]
    fn test_event_names_match_contract() {
        assert_eq!(OperatorEvent::ResizeAttempted.as_str(), "ResizeAttempted");
        assert_eq!(OperatorEvent::ResizeSucceeded.as_str(), "ResizeSucceeded");
        assert_eq!(OperatorEvent::ResizeSkippedNoop.as_str(), "ResizeSkippedNoop");
        assert_eq!(
            OperatorEvent::ResizeDeniedCooldown.as_str(),
            "ResizeDeniedCooldown"
        );
        assert_eq!(OperatorEvent::ResizeFailed.as_str(), "ResizeFailed");
    }

    #[tokio::test]
    async fn test_disconnected_emitter_only_counts() {
        init(&identity());
        let emitter = EventEmitter::disconnected();
        emitter
            .emit(OperatorEvent::ResizeSucceeded, &decision(), "ok".to_string())
            .await;
        assert!(gather().contains("ResizeSucceeded"));
    }
}
