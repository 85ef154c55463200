//! Two-step in-place resize protocol.
//!
//! A non-noop decision is committed against the live pod in phases: ensure
//! the container's resize policy declares restart-not-required, patch CPU
//! request/limit, wait for the orchestrator's acknowledgement, then patch
//! memory the same way. CPU and memory travel in separate strategic patches
//! so a refusal on one dimension cannot poison the other.
//!
//! Failure handling: permission / object-gone / precondition / admission
//! errors are fatal and abort the whole decision; transient network errors
//! and optimistic-concurrency conflicts are retried with exponential backoff
//! and degrade to a non-fatal partial result when the budget runs out. The
//! executor is idempotent: re-issuing a decision that matches live state
//! patches nothing and reports success.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;

use crate::error::ErrorCategory;
use crate::quantity::{format_cpu, format_memory, parse_cpu, parse_memory};
use crate::types::{ContainerView, Decision, ResizeOutcome, ResourceEnvelope};

/// Field manager recorded on every patch this executor issues.
const FIELD_MANAGER: &str = "rightsizer";

/// Pod condition types signalling an in-flight or stuck resize.
const COND_RESIZE_PENDING: &str = "PodResizePending";
const COND_RESIZE_IN_PROGRESS: &str = "PodResizeInProgress";

/// Error type for the resize protocol.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("fatal API error in phase {phase}: {source}")]
    Fatal {
        phase: ResizePhase,
        #[source]
        source: kube::Error,
    },

    #[error("resize rejected as infeasible: {0}")]
    Rejected(String),

    #[error("retry budget exhausted in phase {phase}: {source}")]
    RetriesExhausted {
        phase: ResizePhase,
        #[source]
        source: kube::Error,
    },
}

impl ExecutorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExecutorError::Fatal { .. } => ErrorCategory::Api,
            ExecutorError::Rejected(_) => ErrorCategory::Protocol,
            ExecutorError::RetriesExhausted { .. } => ErrorCategory::Api,
        }
    }

    /// Fatal errors abort the decision and extend the instance's back-off.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutorError::Fatal { .. } | ExecutorError::Rejected(_))
    }
}

/// Protocol phases for one instance. Terminal states are `Done` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizePhase {
    Idle,
    EnsuringPolicy,
    PatchingCpu,
    PatchingMemory,
    Done,
    Failed,
}

impl fmt::Display for ResizePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResizePhase::Idle => "Idle",
            ResizePhase::EnsuringPolicy => "EnsuringPolicy",
            ResizePhase::PatchingCpu => "PatchingCpu",
            ResizePhase::PatchingMemory => "PatchingMemory",
            ResizePhase::Done => "Done",
            ResizePhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Orchestrator acknowledgement of a resize patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeAck {
    /// No resize condition present; the patch has settled
    Settled,
    /// Resize accepted, actuation in progress
    InProgress,
    /// Resize deferred or rejected; `infeasible` marks a hard rejection
    Pending { infeasible: bool, message: String },
}

/// Transient/fatal split for orchestrator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Fatal,
    Transient,
}

/// Classify an orchestrator error. Permission, object-gone, precondition,
/// and admission rejections are fatal; conflicts and transport errors are
/// worth retrying.
pub fn classify(err: &kube::Error) -> FailureKind {
    match err {
        kube::Error::Api(resp) => match resp.code {
            401 | 403 | 404 | 410 | 412 | 422 => FailureKind::Fatal,
            _ => FailureKind::Transient,
        },
        _ => FailureKind::Transient,
    }
}

/// The orchestrator surface the executor needs, mockable for tests.
#[async_trait]
pub trait PodResizeOps: Send + Sync {
    /// Live view of one container on a pod.
    async fn container_state(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<ContainerView, kube::Error>;

    /// Patch the container's resize policy to restart-not-required.
    async fn patch_resize_policy(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<(), kube::Error>;

    /// Issue a strategic patch touching a single resource dimension.
    async fn patch_resources(
        &self,
        namespace: &str,
        pod: &str,
        patch: &serde_json::Value,
    ) -> Result<(), kube::Error>;

    /// Read the orchestrator's resize acknowledgement for a pod.
    async fn resize_ack(&self, namespace: &str, pod: &str) -> Result<ResizeAck, kube::Error>;
}

/// Commits gated decisions through the two-step patch protocol.
pub struct InPlaceResizeExecutor<R> {
    ops: R,
    max_retries: u32,
    backoff_base: Duration,
    ack_timeout: Duration,
    ack_poll_interval: Duration,
}

impl<R: PodResizeOps> InPlaceResizeExecutor<R> {
    pub fn new(ops: R) -> Self {
        Self {
            ops,
            max_retries: 3,
            backoff_base: Duration::from_millis(200),
            ack_timeout: Duration::from_secs(10),
            ack_poll_interval: Duration::from_millis(500),
        }
    }

    #[cfg(test)]
    fn with_timing(mut self, backoff_base: Duration, ack_poll: Duration) -> Self {
        self.backoff_base = backoff_base;
        self.ack_poll_interval = ack_poll;
        self
    }

    /// Commit one non-noop decision. Never panics; every failure is folded
    /// into the structured outcome.
    pub async fn execute(&self, decision: &Decision) -> ResizeOutcome {
        match self.run_protocol(decision).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::debug!(
                    "resize protocol for {} ended in {}: {e}",
                    decision.key,
                    ResizePhase::Failed
                );
                ResizeOutcome {
                    cpu_applied: false,
                    mem_applied: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Like [`execute`](Self::execute) but hands back the typed error so the
    /// pipeline can classify it (fatal vs partial) for back-off handling.
    pub async fn execute_classified(
        &self,
        decision: &Decision,
    ) -> Result<ResizeOutcome, ExecutorError> {
        self.run_protocol(decision).await
    }

    async fn run_protocol(&self, decision: &Decision) -> Result<ResizeOutcome, ExecutorError> {
        let ns = &decision.key.namespace;
        let pod = &decision.pod_name;
        let container = &decision.key.container;

        let mut phase = ResizePhase::EnsuringPolicy;
        log::debug!("{}: {} -> {phase}", decision.key, ResizePhase::Idle);

        // Phase 1: live state + resize-policy annotation.
        let live = self
            .retrying(phase, || self.ops.container_state(ns, pod, container))
            .await?;

        if !live.resize_policy_ok {
            self.retrying(phase, || self.ops.patch_resize_policy(ns, pod, container))
                .await?;
        }

        let live_env = live.envelope;
        let desired = decision.desired;
        let mut outcome = ResizeOutcome::default();
        let mut partial: Option<ExecutorError> = None;

        // Phase 2: CPU.
        if decision.action.touches_cpu() {
            phase = ResizePhase::PatchingCpu;
            log::debug!("{}: -> {phase}", decision.key);
            if cpu_matches(live_env, &desired) {
                // Re-issuing a patch that matches live state is a no-op.
                outcome.cpu_applied = true;
            } else {
                let patch = cpu_patch(container, &desired);
                match self
                    .retrying(phase, || self.ops.patch_resources(ns, pod, &patch))
                    .await
                {
                    Ok(()) => {
                        self.await_ack(ns, pod, &decision.key).await?;
                        outcome.cpu_applied = true;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        // Non-fatal partial failure: memory still gets its chance.
                        log::warn!("{}: CPU step failed non-fatally: {e}", decision.key);
                        partial = Some(e);
                    }
                }
            }
        }

        // Phase 3: memory.
        if decision.action.touches_memory() {
            phase = ResizePhase::PatchingMemory;
            log::debug!("{}: -> {phase}", decision.key);
            if memory_matches(live_env, &desired) {
                outcome.mem_applied = true;
            } else {
                let patch = memory_patch(container, &desired);
                match self
                    .retrying(phase, || self.ops.patch_resources(ns, pod, &patch))
                    .await
                {
                    Ok(()) => {
                        self.await_ack(ns, pod, &decision.key).await?;
                        outcome.mem_applied = true;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        log::warn!("{}: memory step failed non-fatally: {e}", decision.key);
                        partial = Some(e);
                    }
                }
            }
        }

        if let Some(e) = partial {
            outcome.error = Some(e.to_string());
        }
        log::debug!(
            "{}: -> {}",
            decision.key,
            if outcome.error.is_none() { ResizePhase::Done } else { ResizePhase::Failed }
        );
        Ok(outcome)
    }

    /// Poll the acknowledgement until the resize settles, the orchestrator
    /// rejects it, or the bounded wait expires (expiry is non-fatal; the
    /// next sweep re-converges).
    async fn await_ack(
        &self,
        ns: &str,
        pod: &str,
        key: &crate::types::ContainerKey,
    ) -> Result<(), ExecutorError> {
        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        loop {
            match self.ops.resize_ack(ns, pod).await {
                Ok(ResizeAck::Settled) => return Ok(()),
                Ok(ResizeAck::Pending { infeasible: true, message }) => {
                    return Err(ExecutorError::Rejected(message));
                }
                Ok(ResizeAck::InProgress) | Ok(ResizeAck::Pending { .. }) => {}
                Err(e) => {
                    // Ack reads are best-effort; losing one is not a failure.
                    log::debug!("{key}: ack read failed: {e}");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                log::debug!("{key}: resize ack wait timed out; continuing");
                return Ok(());
            }
            tokio::time::sleep(self.ack_poll_interval).await;
        }
    }

    /// Retry a call on transient failures with exponential backoff.
    async fn retrying<T, F, Fut>(&self, phase: ResizePhase, op: F) -> Result<T, ExecutorError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, kube::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if classify(&e) == FailureKind::Fatal => {
                    return Err(ExecutorError::Fatal { phase, source: e });
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(ExecutorError::RetriesExhausted { phase, source: e });
                    }
                    let backoff = self.backoff_base * 2u32.pow(attempt);
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn cpu_matches(live: Option<ResourceEnvelope>, desired: &ResourceEnvelope) -> bool {
    live.is_some_and(|l| l.cpu_request == desired.cpu_request && l.cpu_limit == desired.cpu_limit)
}

fn memory_matches(live: Option<ResourceEnvelope>, desired: &ResourceEnvelope) -> bool {
    live.is_some_and(|l| {
        l.memory_request == desired.memory_request && l.memory_limit == desired.memory_limit
    })
}

/// Strategic patch touching only the CPU request/limit of one container.
fn cpu_patch(container: &str, desired: &ResourceEnvelope) -> serde_json::Value {
    json!({
        "spec": {
            "containers": [{
                "name": container,
                "resources": {
                    "requests": {"cpu": format_cpu(desired.cpu_request)},
                    "limits": {"cpu": format_cpu(desired.cpu_limit)}
                }
            }]
        }
    })
}

/// Strategic patch touching only the memory request/limit of one container.
fn memory_patch(container: &str, desired: &ResourceEnvelope) -> serde_json::Value {
    json!({
        "spec": {
            "containers": [{
                "name": container,
                "resources": {
                    "requests": {"memory": format_memory(desired.memory_request)},
                    "limits": {"memory": format_memory(desired.memory_limit)}
                }
            }]
        }
    })
}

// ============================================================================
// Live orchestrator implementation
// ============================================================================

/// `PodResizeOps` backed by the cluster API.
pub struct KubeResizeOps {
    client: Client,
}

impl KubeResizeOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Extract the sizing view of one container from a pod spec.
pub fn container_view(pod: &Pod, container: &str) -> Option<ContainerView> {
    let spec = pod.spec.as_ref()?;
    let c = spec.containers.iter().find(|c| c.name == container)?;

    let envelope = c.resources.as_ref().and_then(|r| {
        let requests = r.requests.as_ref()?;
        let limits = r.limits.as_ref()?;
        Some(ResourceEnvelope {
            cpu_request: parse_cpu(&requests.get("cpu")?.0)?,
            cpu_limit: parse_cpu(&limits.get("cpu")?.0)?,
            memory_request: parse_memory(&requests.get("memory")?.0)?,
            memory_limit: parse_memory(&limits.get("memory")?.0)?,
        })
    });

    let resize_policy_ok = c.resize_policy.as_ref().is_some_and(|policies| {
        let ok = |resource: &str| {
            policies
                .iter()
                .any(|p| p.resource_name == resource && p.restart_policy == "NotRequired")
        };
        ok("cpu") && ok("memory")
    });

    Some(ContainerView {
        name: c.name.clone(),
        envelope,
        resize_policy_ok,
    })
}

#[async_trait]
impl PodResizeOps for KubeResizeOps {
    async fn container_state(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<ContainerView, kube::Error> {
        let live = self.pods(namespace).get(pod).await?;
        container_view(&live, container).ok_or_else(|| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("container {container} not found on pod {namespace}/{pod}"),
                reason: "NotFound".to_string(),
                code: 404,
            })
        })
    }

    async fn patch_resize_policy(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<(), kube::Error> {
        let patch = json!({
            "spec": {
                "containers": [{
                    "name": container,
                    "resizePolicy": [
                        {"resourceName": "cpu", "restartPolicy": "NotRequired"},
                        {"resourceName": "memory", "restartPolicy": "NotRequired"}
                    ]
                }]
            }
        });
        self.pods(namespace)
            .patch(pod, &PatchParams::apply(FIELD_MANAGER), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    async fn patch_resources(
        &self,
        namespace: &str,
        pod: &str,
        patch: &serde_json::Value,
    ) -> Result<(), kube::Error> {
        self.pods(namespace)
            .patch(pod, &PatchParams::apply(FIELD_MANAGER), &Patch::Strategic(patch))
            .await?;
        Ok(())
    }

    async fn resize_ack(&self, namespace: &str, pod: &str) -> Result<ResizeAck, kube::Error> {
        let live = self.pods(namespace).get_status(pod).await?;
        let conditions = live
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref());

        let Some(conditions) = conditions else {
            return Ok(ResizeAck::Settled);
        };

        for cond in conditions {
            if cond.type_ == COND_RESIZE_PENDING && cond.status == "True" {
                let infeasible = cond.reason.as_deref() == Some("Infeasible");
                return Ok(ResizeAck::Pending {
                    infeasible,
                    message: cond.message.clone().unwrap_or_default(),
                });
            }
            if cond.type_ == COND_RESIZE_IN_PROGRESS && cond.status == "True" {
                return Ok(ResizeAck::InProgress);
            }
        }
        Ok(ResizeAck::Settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::MIB;
    use crate::types::{ContainerKey, DecisionAction, DecisionReason};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} ({code})"),
            reason: reason.to_string(),
            code,
        })
    }

    fn env(cr: u64, cl: u64, mr: u64, ml: u64) -> ResourceEnvelope {
        ResourceEnvelope {
            cpu_request: cr,
            cpu_limit: cl,
            memory_request: mr,
            memory_limit: ml,
        }
    }

    fn decision(action: DecisionAction, current: ResourceEnvelope, desired: ResourceEnvelope) -> Decision {
        Decision {
            key: ContainerKey::new("prod", "web", "app"),
            pod_name: "web-0".to_string(),
            current,
            desired,
            action,
            reason: DecisionReason::ThresholdCrossed,
            timestamp: Utc::now(),
        }
    }

    /// Scripted in-memory orchestrator.
    struct MockOps {
        live: Mutex<ResourceEnvelope>,
        resize_policy_ok: Mutex<bool>,
        patches: Mutex<Vec<serde_json::Value>>,
        policy_patches: AtomicU64,
        /// Errors to inject, consumed per patch_resources call
        patch_failures: Mutex<VecDeque<kube::Error>>,
        ack: Mutex<ResizeAck>,
    }

    impl MockOps {
        fn new(live: ResourceEnvelope) -> Self {
            Self {
                live: Mutex::new(live),
                resize_policy_ok: Mutex::new(true),
                patches: Mutex::new(Vec::new()),
                policy_patches: AtomicU64::new(0),
                patch_failures: Mutex::new(VecDeque::new()),
                ack: Mutex::new(ResizeAck::Settled),
            }
        }

        fn apply(&self, patch: &serde_json::Value) {
            let mut live = self.live.lock();
            let resources = &patch["spec"]["containers"][0]["resources"];
            if let Some(cpu) = resources["requests"]["cpu"].as_str() {
                live.cpu_request = parse_cpu(cpu).unwrap();
            }
            if let Some(cpu) = resources["limits"]["cpu"].as_str() {
                live.cpu_limit = parse_cpu(cpu).unwrap();
            }
            if let Some(mem) = resources["requests"]["memory"].as_str() {
                live.memory_request = parse_memory(mem).unwrap();
            }
            if let Some(mem) = resources["limits"]["memory"].as_str() {
                live.memory_limit = parse_memory(mem).unwrap();
            }
        }
    }

    #[async_trait]
    impl PodResizeOps for MockOps {
        async fn container_state(
            &self,
            _ns: &str,
            _pod: &str,
            container: &str,
        ) -> Result<ContainerView, kube::Error> {
            Ok(ContainerView {
                name: container.to_string(),
                envelope: Some(*self.live.lock()),
                resize_policy_ok: *self.resize_policy_ok.lock(),
            })
        }

        async fn patch_resize_policy(
            &self,
            _ns: &str,
            _pod: &str,
            _container: &str,
        ) -> Result<(), kube::Error> {
            self.policy_patches.fetch_add(1, Ordering::SeqCst);
            *self.resize_policy_ok.lock() = true;
            Ok(())
        }

        async fn patch_resources(
            &self,
            _ns: &str,
            _pod: &str,
            patch: &serde_json::Value,
        ) -> Result<(), kube::Error> {
            if let Some(err) = self.patch_failures.lock().pop_front() {
                return Err(err);
            }
            self.patches.lock().push(patch.clone());
            self.apply(patch);
            Ok(())
        }

        async fn resize_ack(&self, _ns: &str, _pod: &str) -> Result<ResizeAck, kube::Error> {
            Ok(self.ack.lock().clone())
        }
    }

    fn executor(ops: MockOps) -> InPlaceResizeExecutor<MockOps> {
        InPlaceResizeExecutor::new(ops)
            .with_timing(Duration::from_millis(1), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_both_dimensions_patch_in_two_steps() {
        let current = env(100, 200, 256 * MIB, 256 * MIB);
        let desired = env(150, 300, 512 * MIB, 512 * MIB);
        let exec = executor(MockOps::new(current));

        let outcome = exec.execute(&decision(DecisionAction::Both, current, desired)).await;
        assert!(outcome.succeeded());
        assert!(outcome.cpu_applied && outcome.mem_applied);

        let patches = exec.ops.patches.lock();
        assert_eq!(patches.len(), 2);
        // First patch touches only CPU, second only memory
        assert!(patches[0]["spec"]["containers"][0]["resources"]["requests"]["cpu"].is_string());
        assert!(patches[0]["spec"]["containers"][0]["resources"]["requests"]["memory"].is_null());
        assert!(patches[1]["spec"]["containers"][0]["resources"]["requests"]["memory"].is_string());
        assert!(patches[1]["spec"]["containers"][0]["resources"]["requests"]["cpu"].is_null());
        assert_eq!(*exec.ops.live.lock(), desired);
    }

    #[tokio::test]
    async fn test_missing_resize_policy_is_patched_first() {
        let current = env(100, 200, 256 * MIB, 256 * MIB);
        let desired = env(150, 300, 256 * MIB, 256 * MIB);
        let ops = MockOps::new(current);
        *ops.resize_policy_ok.lock() = false;
        let exec = executor(ops);

        let outcome = exec
            .execute(&decision(DecisionAction::CpuOnly, current, desired))
            .await;
        assert!(outcome.succeeded());
        assert_eq!(exec.ops.policy_patches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idempotent_reissue_patches_once() {
        let current = env(100, 200, 256 * MIB, 256 * MIB);
        let desired = env(150, 300, 512 * MIB, 512 * MIB);
        let exec = executor(MockOps::new(current));
        let d = decision(DecisionAction::Both, current, desired);

        let first = exec.execute(&d).await;
        let second = exec.execute(&d).await;

        assert!(first.succeeded() && second.succeeded());
        assert!(second.cpu_applied && second.mem_applied);
        // Exactly one observable patch cycle across both invocations
        assert_eq!(exec.ops.patches.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_whole_decision() {
        let current = env(100, 200, 256 * MIB, 256 * MIB);
        let desired = env(150, 300, 512 * MIB, 512 * MIB);
        let ops = MockOps::new(current);
        ops.patch_failures.lock().push_back(api_error(403, "Forbidden"));
        let exec = executor(ops);

        let result = exec
            .execute_classified(&decision(DecisionAction::Both, current, desired))
            .await;
        let err = result.unwrap_err();
        assert!(err.is_fatal());
        // Memory was never attempted
        assert!(exec.ops.patches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transient_conflict_is_retried() {
        let current = env(100, 200, 256 * MIB, 256 * MIB);
        let desired = env(150, 300, 256 * MIB, 256 * MIB);
        let ops = MockOps::new(current);
        ops.patch_failures.lock().push_back(api_error(409, "Conflict"));
        let exec = executor(ops);

        let outcome = exec
            .execute(&decision(DecisionAction::CpuOnly, current, desired))
            .await;
        assert!(outcome.succeeded());
        assert_eq!(exec.ops.patches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cpu_retry_exhaustion_is_partial_memory_proceeds() {
        let current = env(100, 200, 256 * MIB, 256 * MIB);
        let desired = env(150, 300, 512 * MIB, 512 * MIB);
        let ops = MockOps::new(current);
        {
            let mut failures = ops.patch_failures.lock();
            for _ in 0..4 {
                failures.push_back(api_error(500, "InternalError"));
            }
        }
        let exec = executor(ops);

        let outcome = exec.execute(&decision(DecisionAction::Both, current, desired)).await;
        assert!(!outcome.cpu_applied);
        assert!(outcome.mem_applied);
        assert!(outcome.error.is_some());
        // The one successful patch is the memory step
        let patches = exec.ops.patches.lock();
        assert_eq!(patches.len(), 1);
        assert!(patches[0]["spec"]["containers"][0]["resources"]["requests"]["memory"].is_string());
    }

    #[tokio::test]
    async fn test_infeasible_ack_is_protocol_fatal() {
        let current = env(100, 200, 256 * MIB, 256 * MIB);
        let desired = env(150, 300, 256 * MIB, 256 * MIB);
        let ops = MockOps::new(current);
        *ops.ack.lock() = ResizeAck::Pending {
            infeasible: true,
            message: "node lacks capacity".to_string(),
        };
        let exec = executor(ops);

        let err = exec
            .execute_classified(&decision(DecisionAction::CpuOnly, current, desired))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Rejected(_)));
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify(&api_error(403, "Forbidden")), FailureKind::Fatal);
        assert_eq!(classify(&api_error(404, "NotFound")), FailureKind::Fatal);
        assert_eq!(classify(&api_error(422, "Invalid")), FailureKind::Fatal);
        assert_eq!(classify(&api_error(409, "Conflict")), FailureKind::Transient);
        assert_eq!(classify(&api_error(500, "InternalError")), FailureKind::Transient);
        assert_eq!(classify(&api_error(429, "TooManyRequests")), FailureKind::Transient);
    }

    #[test]
    fn test_patches_touch_single_dimension() {
        let desired = env(1500, 3000, 768 * MIB, 768 * MIB);
        let cpu = cpu_patch("app", &desired);
        assert_eq!(cpu["spec"]["containers"][0]["resources"]["requests"]["cpu"], "1500m");
        assert!(cpu["spec"]["containers"][0]["resources"]["requests"]["memory"].is_null());

        let mem = memory_patch("app", &desired);
        assert_eq!(
            mem["spec"]["containers"][0]["resources"]["requests"]["memory"],
            "768Mi"
        );
        assert!(mem["spec"]["containers"][0]["resources"]["requests"]["cpu"].is_null());
    }
}
