//! Periodic reconcile sweeps over all in-scope workload instances.
//!
//! Each sweep reads the live instance list once, runs the per-instance
//! pipeline (usage snapshot → policy resolution → prediction → calculation →
//! gating) under a bounded worker pool, then commits the gated decisions in
//! order of largest relative change first until the per-sweep budget is
//! spent. Ticks never pile up: a sweep that overruns the interval simply
//! delays the next one. Shutdown is propagated to every suspension point;
//! the executor's idempotence makes an abandoned patch safe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::calculator::{self, DimensionPrediction, EnvelopePrediction};
use crate::capability::CapabilityDetector;
use crate::config::{ConfigSnapshot, ConfigStore};
use crate::error::ErrorCategory;
use crate::executor::{container_view, InPlaceResizeExecutor, PodResizeOps};
use crate::gate::{DecisionGate, GateInput};
use crate::policy::{PolicyMode, PolicyResolver, ResourceFormula};
use crate::provider::UsageProvider;
use crate::store::TimeSeriesStore;
use crate::telemetry::{self, EventEmitter, OperatorEvent};
use crate::types::{Decision, DecisionReason, WorkloadInstance};

/// Source of the live instance list, one read per sweep.
#[async_trait]
pub trait InstanceLister: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<WorkloadInstance>, kube::Error>;
}

/// Lists running pods across the cluster.
pub struct KubeInstanceLister {
    client: Client,
}

impl KubeInstanceLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InstanceLister for KubeInstanceLister {
    async fn list_instances(&self) -> Result<Vec<WorkloadInstance>, kube::Error> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default().fields("status.phase=Running"))
            .await?;
        Ok(list.items.iter().filter_map(pod_to_instance).collect())
    }
}

/// Build the sizing view of one live pod.
pub fn pod_to_instance(pod: &Pod) -> Option<WorkloadInstance> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone()?;

    let (workload_kind, workload) = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .map(|owner| (Some(owner.kind.clone()), owner_workload_name(owner)))
        .unwrap_or((None, name.clone()));

    let containers = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .filter_map(|c| container_view(pod, &c.name))
        .collect();

    Some(WorkloadInstance {
        namespace,
        pod_name: name,
        workload,
        workload_kind,
        labels: pod.labels().clone(),
        containers,
    })
}

/// ReplicaSet owners carry the deployment name plus a hash suffix; strip it
/// so samples aggregate per deployment.
fn owner_workload_name(owner: &k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference) -> String {
    if owner.kind == "ReplicaSet" {
        if let Some(idx) = owner.name.rfind('-') {
            return owner.name[..idx].to_string();
        }
    }
    owner.name.clone()
}

/// Namespaces the loop never touches regardless of configuration.
fn is_system_namespace(namespace: &str) -> bool {
    matches!(
        namespace,
        "kube-system" | "kube-public" | "kube-node-lease"
    )
}

// ============================================================================
// API rate budget
// ============================================================================

/// Token bucket governing global orchestrator API pressure.
pub struct ApiBudget {
    state: Mutex<Bucket>,
}

struct Bucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl ApiBudget {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            state: Mutex::new(Bucket {
                qps,
                burst: burst as f64,
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Update the budget without refunding spent tokens.
    pub fn reconfigure(&self, qps: f64, burst: u32) {
        let mut bucket = self.state.lock();
        bucket.qps = qps;
        bucket.burst = burst as f64;
        bucket.tokens = bucket.tokens.min(bucket.burst);
    }

    /// Take one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock();
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * bucket.qps).min(bucket.burst);
                bucket.last_refill = Instant::now();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.qps)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// ============================================================================
// Sweep bookkeeping
// ============================================================================

/// Aggregate shape of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub instances: usize,
    pub decisions: usize,
    pub noops: usize,
    pub advised: usize,
    pub commits: usize,
    pub failures: usize,
    pub deferred: usize,
    /// True when capabilities or --dry-run forced observe-only behaviour
    pub observe_only: bool,
}

struct GatedDecision {
    decision: Decision,
    instance_id: String,
    mode: PolicyMode,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Drives the sizing control loop.
pub struct ReconcileScheduler<L, P, R> {
    lister: L,
    provider: Arc<P>,
    store: Arc<TimeSeriesStore>,
    resolver: Arc<PolicyResolver>,
    gate: Arc<DecisionGate>,
    executor: Arc<InPlaceResizeExecutor<R>>,
    capabilities: Arc<CapabilityDetector>,
    config: Arc<ConfigStore>,
    emitter: Arc<EventEmitter>,
    budget: ApiBudget,
    dry_run: bool,
}

impl<L, P, R> ReconcileScheduler<L, P, R>
where
    L: InstanceLister,
    P: UsageProvider + 'static,
    R: PodResizeOps,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lister: L,
        provider: Arc<P>,
        store: Arc<TimeSeriesStore>,
        resolver: Arc<PolicyResolver>,
        gate: Arc<DecisionGate>,
        executor: Arc<InPlaceResizeExecutor<R>>,
        capabilities: Arc<CapabilityDetector>,
        config: Arc<ConfigStore>,
        emitter: Arc<EventEmitter>,
        dry_run: bool,
    ) -> Self {
        let snapshot = config.snapshot();
        let budget = ApiBudget::new(snapshot.qps, snapshot.burst);
        Self {
            lister,
            provider,
            store,
            resolver,
            gate,
            executor,
            capabilities,
            config,
            emitter,
            budget,
            dry_run,
        }
    }

    /// The config store backing this scheduler.
    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Tick until the shutdown signal flips. The previous sweep always
    /// finishes (or hits its deadline) before the next tick is armed, so
    /// sweeps never pile up.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.config.snapshot().reconcile_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("scheduler shutting down");
                        return;
                    }
                }
            }

            let started = Instant::now();
            let deadline = interval.max(Duration::from_secs(10)) * 2;
            let sweep_signal = shutdown.clone();
            let summary = tokio::select! {
                summary = tokio::time::timeout(deadline, self.sweep(&sweep_signal)) => {
                    match summary {
                        Ok(s) => s,
                        Err(_) => {
                            log::warn!("sweep exceeded its {deadline:?} deadline; abandoned");
                            continue;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("scheduler shutting down mid-sweep");
                        return;
                    }
                    continue;
                }
            };

            if started.elapsed() > interval {
                log::debug!("sweep overran the reconcile interval; next tick delayed");
            }
            log::info!(
                "sweep complete: {} instances, {} decisions ({} noop, {} advised), \
                 {} commits, {} failures, {} deferred{}",
                summary.instances,
                summary.decisions,
                summary.noops,
                summary.advised,
                summary.commits,
                summary.failures,
                summary.deferred,
                if summary.observe_only { " [observe-only]" } else { "" }
            );
        }
    }

    /// One full sweep. Public so tests can drive sweeps directly.
    pub async fn sweep(&self, shutdown: &watch::Receiver<bool>) -> SweepSummary {
        let sweep_started = Instant::now();
        let config = self.config.snapshot();

        // Policy set follows the config generation.
        if self.resolver.generation() != config.generation {
            self.resolver.reload(
                config.policies.clone(),
                config.default_strategy,
                config.default_constraints,
                config.default_mode,
                config.generation,
            );
            self.budget.reconfigure(config.qps, config.burst);
        }

        let capabilities = self.capabilities.snapshot();
        let observe_only = self.dry_run || !capabilities.in_place_resize;

        self.provider.begin_sweep();

        self.budget.acquire().await;
        let instances = match self.lister.list_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                log::error!("instance list failed; sweep skipped: {e}");
                telemetry::record_failure(ErrorCategory::Api);
                return SweepSummary {
                    observe_only,
                    ..Default::default()
                };
            }
        };

        let scoped: Vec<WorkloadInstance> = instances
            .into_iter()
            .filter(|i| in_scope(&i.namespace, &config))
            .collect();
        let instance_count = scoped.len();

        // Decision phase: bounded-concurrency pipeline per instance.
        let results: Vec<Vec<GatedDecision>> = stream::iter(scoped)
            .map(|instance| self.decide_instance(instance, &config, capabilities.metrics_api, shutdown))
            .buffer_unordered(config.max_concurrent_reconciles)
            .collect()
            .await;

        let mut summary = SweepSummary {
            instances: instance_count,
            observe_only,
            ..Default::default()
        };

        let mut committable: Vec<GatedDecision> = Vec::new();
        for gated in results.into_iter().flatten() {
            summary.decisions += 1;
            telemetry::record_decision(&gated.decision);

            if gated.decision.is_noop() {
                summary.noops += 1;
                match gated.decision.reason {
                    DecisionReason::Cooldown => {
                        telemetry::count_event(OperatorEvent::ResizeDeniedCooldown)
                    }
                    _ => telemetry::count_event(OperatorEvent::ResizeSkippedNoop),
                }
                continue;
            }

            if observe_only || gated.mode != PolicyMode::Enforce {
                summary.advised += 1;
                if gated.mode != PolicyMode::Observe {
                    log::info!(
                        "advised resize for {}: {:?} -> {:?} ({})",
                        gated.decision.key,
                        gated.decision.current,
                        gated.decision.desired,
                        gated.decision.reason
                    );
                }
                continue;
            }

            committable.push(gated);
        }

        // Commit phase: largest relative change first, bounded by the budget.
        committable.sort_by(|a, b| {
            b.decision
                .magnitude()
                .partial_cmp(&a.decision.magnitude())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        summary.deferred = committable.len().saturating_sub(config.commit_budget_per_sweep);

        for gated in committable.into_iter().take(config.commit_budget_per_sweep) {
            if *shutdown.borrow() {
                break;
            }
            self.commit(gated, &mut summary).await;
        }

        telemetry::record_sweep(summary.instances, sweep_started.elapsed());
        summary
    }

    async fn commit(&self, gated: GatedDecision, summary: &mut SweepSummary) {
        let decision = &gated.decision;
        self.emitter
            .emit(
                OperatorEvent::ResizeAttempted,
                decision,
                format!(
                    "resizing {:?}: {:?} -> {:?}",
                    decision.action, decision.current, decision.desired
                ),
            )
            .await;

        self.budget.acquire().await;
        match self.executor.execute_classified(decision).await {
            Ok(outcome) if outcome.succeeded() => {
                summary.commits += 1;
                self.gate.record_commit(&gated.instance_id, decision.timestamp);
                telemetry::record_commit(decision, true);
                self.emitter
                    .emit(
                        OperatorEvent::ResizeSucceeded,
                        decision,
                        format!("resized to {:?}", decision.desired),
                    )
                    .await;
                log::info!(
                    "committed resize for {}: {:?} -> {:?}",
                    decision.key,
                    decision.current,
                    decision.desired
                );
            }
            Ok(outcome) => {
                // Partial: some dimension landed, the rest retries next sweep.
                summary.failures += 1;
                summary.commits += usize::from(outcome.cpu_applied || outcome.mem_applied);
                if outcome.cpu_applied || outcome.mem_applied {
                    self.gate.record_commit(&gated.instance_id, decision.timestamp);
                }
                telemetry::record_commit(decision, false);
                telemetry::record_failure(ErrorCategory::Api);
                self.emitter
                    .emit(
                        OperatorEvent::ResizeFailed,
                        decision,
                        outcome.error.unwrap_or_else(|| "partial failure".to_string()),
                    )
                    .await;
            }
            Err(e) => {
                summary.failures += 1;
                let backoff = self
                    .gate
                    .record_fatal_failure(&gated.instance_id, decision.timestamp);
                telemetry::record_commit(decision, false);
                telemetry::record_failure(e.category());
                self.emitter
                    .emit(OperatorEvent::ResizeFailed, decision, e.to_string())
                    .await;
                log::warn!(
                    "resize for {} failed ({e}); instance backed off for {backoff:?}",
                    decision.key
                );
            }
        }
    }

    /// The per-instance pipeline: A → D → C → E → F for every container.
    async fn decide_instance(
        &self,
        instance: WorkloadInstance,
        config: &ConfigSnapshot,
        metrics_capable: bool,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<GatedDecision> {
        let mut gated = Vec::new();
        let policy = self.resolver.resolve(&instance);
        let now = Utc::now();

        for container in &instance.containers {
            if *shutdown.borrow() {
                break;
            }
            // Containers without a full envelope have nothing to resize from.
            let Some(current) = container.envelope else {
                continue;
            };
            let key = instance.container_key(&container.name);

            let usage_ok = if metrics_capable {
                match self
                    .provider
                    .snapshot(&instance.namespace, &instance.pod_name, &container.name)
                    .await
                {
                    Ok(Some(sample)) => {
                        self.store.record(key.clone(), sample);
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        log::debug!("usage unavailable for {key}: {e}");
                        telemetry::record_failure(ErrorCategory::Metrics);
                        false
                    }
                }
            } else {
                // No metrics backend: adaptive sizing suppressed entirely.
                false
            };

            // With no metrics backend only the conservative pin-to-current
            // recommendation is permitted, however old the stored history.
            let aggregate = if metrics_capable {
                self.store.percentile(
                    &key,
                    policy.strategy.window(),
                    policy.strategy.percentile,
                    now,
                )
            } else {
                None
            };

            // Without a usable window the proposal pins to the current
            // envelope; the gate then collapses it to a noop.
            let proposed = match aggregate {
                Some(usage) => {
                    let prediction = if config.prediction_enabled {
                        self.predict(&key, config, &policy, now)
                    } else {
                        None
                    };
                    match calculator::compute_envelope(
                        usage,
                        &policy.strategy,
                        prediction.as_ref(),
                        config.prediction_confidence_threshold,
                    ) {
                        Ok(env) => env,
                        Err(e) => {
                            log::warn!("calculator veto for {key}: {e}");
                            telemetry::record_failure(ErrorCategory::Internal);
                            continue;
                        }
                    }
                }
                None => current,
            };

            let decision = self.gate.evaluate(GateInput {
                key,
                pod_name: instance.pod_name.clone(),
                instance_id: instance.instance_id(),
                current,
                proposed,
                constraints: policy.constraints,
                usage_ok,
                now,
            });

            gated.push(GatedDecision {
                decision,
                instance_id: instance.instance_id(),
                mode: policy.mode,
            });
        }
        gated
    }

    /// Forecast both dimensions and map them to request level so they can
    /// compete with the base recommendation.
    fn predict(
        &self,
        key: &crate::types::ContainerKey,
        config: &ConfigSnapshot,
        policy: &crate::policy::EffectivePolicy,
        now: chrono::DateTime<Utc>,
    ) -> Option<EnvelopePrediction> {
        let algo = crate::predictor::by_name(&config.prediction_method)?;
        let (cpu_series, mem_series) =
            self.store
                .series_for(key, policy.strategy.window(), now);
        let horizon = config.reconcile_interval.as_secs_f64();

        let to_dimension = |series: &[(f64, f64)], formula: &ResourceFormula| {
            if series.is_empty() {
                return None;
            }
            let forecast = crate::predictor::forecast(algo.as_ref(), series, horizon);
            if forecast.confidence <= 0.0 {
                return None;
            }
            Some(DimensionPrediction {
                request: prediction_request(forecast.predicted_value, formula),
                confidence: forecast.confidence,
            })
        };

        Some(EnvelopePrediction {
            cpu: to_dimension(&cpu_series, &policy.strategy.cpu),
            memory: to_dimension(&mem_series, &policy.strategy.memory),
        })
    }
}

/// Apply the strategy formula to a forecast usage value.
fn prediction_request(predicted_usage: f64, formula: &ResourceFormula) -> u64 {
    (predicted_usage * formula.multiplier).round() as u64 + formula.addition
}

fn in_scope(namespace: &str, config: &ConfigSnapshot) -> bool {
    if is_system_namespace(namespace) {
        return false;
    }
    if !config.namespace_include.is_empty()
        && !config.namespace_include.iter().any(|n| n == namespace)
    {
        return false;
    }
    !config.namespace_exclude.iter().any(|n| n == namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_namespaces_never_in_scope() {
        let config = ConfigSnapshot::defaults();
        assert!(!in_scope("kube-system", &config));
        assert!(!in_scope("kube-public", &config));
        assert!(in_scope("prod", &config));
    }

    #[test]
    fn test_namespace_scope_lists() {
        let mut config = ConfigSnapshot::defaults();
        config.namespace_include = vec!["prod".to_string()];
        assert!(in_scope("prod", &config));
        assert!(!in_scope("staging", &config));

        let mut config = ConfigSnapshot::defaults();
        config.namespace_exclude = vec!["staging".to_string()];
        assert!(in_scope("prod", &config));
        assert!(!in_scope("staging", &config));
    }

    #[test]
    fn test_replicaset_owner_collapses_to_deployment() {
        let owner = k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            kind: "ReplicaSet".to_string(),
            name: "web-7d9f8b6c5".to_string(),
            ..Default::default()
        };
        assert_eq!(owner_workload_name(&owner), "web");

        let owner = k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            kind: "StatefulSet".to_string(),
            name: "db".to_string(),
            ..Default::default()
        };
        assert_eq!(owner_workload_name(&owner), "db");
    }

    #[test]
    fn test_prediction_request_applies_formula() {
        let formula = ResourceFormula {
            multiplier: 1.5,
            addition: 10,
            ..ResourceFormula::default_cpu()
        };
        assert_eq!(prediction_request(100.0, &formula), 160);
    }

    #[tokio::test]
    async fn test_api_budget_burst_then_throttle() {
        let budget = ApiBudget::new(1000.0, 3);
        let start = Instant::now();
        for _ in 0..3 {
            budget.acquire().await;
        }
        // Burst tokens are free
        assert!(start.elapsed() < Duration::from_millis(50));
        budget.acquire().await;
        // The fourth token had to wait for a refill at 1000 qps
        assert!(start.elapsed() >= Duration::from_millis(1));
    }
}
