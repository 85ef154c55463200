//! Decision gating: thresholds, cooldowns, memory-decrease safety, max-step
//! clamping, and QoS preservation, applied in a fixed order to the
//! calculator's proposal before anything reaches the executor.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::time::Duration;

use crate::policy::PolicyConstraints;
use crate::quantity::ceil_to_mib;
use crate::types::{
    ContainerKey, Decision, DecisionAction, DecisionReason, ResourceEnvelope,
};

/// First back-off applied after a fatal executor failure.
const BACKOFF_BASE: Duration = Duration::from_secs(60);
/// Back-off ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, Default)]
struct CooldownState {
    last_commit: Option<DateTime<Utc>>,
    backoff_until: Option<DateTime<Utc>>,
    backoff: Duration,
}

/// Inputs for gating one container proposal.
#[derive(Debug, Clone)]
pub struct GateInput {
    pub key: ContainerKey,
    pub pod_name: String,
    /// Cooldown identity (per instance, not per container)
    pub instance_id: String,
    pub current: ResourceEnvelope,
    pub proposed: ResourceEnvelope,
    pub constraints: PolicyConstraints,
    /// Current-usage evidence was available this sweep
    pub usage_ok: bool,
    pub now: DateTime<Utc>,
}

/// Applies the ordered gating rules and tracks per-instance cooldown and
/// back-off state across sweeps. The map is sharded; writers to different
/// instances never contend.
#[derive(Default)]
pub struct DecisionGate {
    cooldowns: DashMap<String, CooldownState>,
}

impl DecisionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the rules in order and produce the gated decision.
    pub fn evaluate(&self, input: GateInput) -> Decision {
        let current = input.current;
        let mut desired = input.proposed;
        let mut memory_suppressed = false;

        // 1. Direction thresholds, per dimension. A dimension that moves less
        //    than its threshold is pinned to the current envelope.
        let up = 1.0 + input.constraints.scale_up_threshold;
        let down = 1.0 - input.constraints.scale_down_threshold;

        let cpu_up = (desired.cpu_request as f64) > (current.cpu_request as f64) * up;
        let cpu_down = (desired.cpu_request as f64) < (current.cpu_request as f64) * down;
        // Without current-usage evidence no downscale is permitted.
        if !(cpu_up || (cpu_down && input.usage_ok)) {
            desired.cpu_request = current.cpu_request;
            desired.cpu_limit = current.cpu_limit;
        }

        let mem_up = (desired.memory_request as f64) > (current.memory_request as f64) * up;
        let mem_down = (desired.memory_request as f64) < (current.memory_request as f64) * down;
        if !(mem_up || (mem_down && input.usage_ok)) {
            desired.memory_request = current.memory_request;
            desired.memory_limit = current.memory_limit;
        }

        // 2. Cooldown / back-off veto.
        if let Some(reason) = self.active_veto(&input.instance_id, &input.constraints, input.now) {
            return self.decision(input, current, DecisionAction::Noop, reason);
        }

        // 3. Memory-decrease safety: the orchestrator may refuse a live
        //    shrink, and a refused shrink oscillates. Drop the memory change;
        //    CPU proceeds.
        if desired.memory_request < current.memory_request
            && !input.constraints.allow_memory_decrease
        {
            desired.memory_request = current.memory_request;
            desired.memory_limit = current.memory_limit;
            memory_suppressed = true;
        }

        // 4. Max-step: clamp each dimension's change magnitude.
        let step = input.constraints.max_change_per_step;
        if step > 0.0 {
            desired.cpu_request = clamp_step(current.cpu_request, desired.cpu_request, step);
            desired.cpu_limit = clamp_step(current.cpu_limit, desired.cpu_limit, step);
            desired.memory_request =
                mib_step(current.memory_request, desired.memory_request, step);
            desired.memory_limit = mib_step(current.memory_limit, desired.memory_limit, step);
        }

        // 5. QoS preservation: a guaranteed instance must stay guaranteed,
        //    dimension by dimension.
        if current.is_guaranteed() {
            if desired.cpu_request != desired.cpu_limit {
                desired.cpu_request = current.cpu_request;
                desired.cpu_limit = current.cpu_limit;
            }
            if desired.memory_request != desired.memory_limit {
                desired.memory_request = current.memory_request;
                desired.memory_limit = current.memory_limit;
            }
        }

        // 6. Noop collapse.
        let cpu_changed = desired.cpu_request != current.cpu_request
            || desired.cpu_limit != current.cpu_limit;
        let mem_changed = desired.memory_request != current.memory_request
            || desired.memory_limit != current.memory_limit;

        let action = match (cpu_changed, mem_changed) {
            (false, false) => DecisionAction::Noop,
            (true, false) => DecisionAction::CpuOnly,
            (false, true) => DecisionAction::MemOnly,
            (true, true) => DecisionAction::Both,
        };

        let reason = if action == DecisionAction::Noop {
            if memory_suppressed {
                DecisionReason::MemoryDecreaseSuppressed
            } else if !input.usage_ok {
                DecisionReason::MissingUsage
            } else {
                DecisionReason::WithinThresholds
            }
        } else {
            DecisionReason::ThresholdCrossed
        };

        self.decision(input, desired, action, reason)
    }

    fn decision(
        &self,
        input: GateInput,
        desired: ResourceEnvelope,
        action: DecisionAction,
        reason: DecisionReason,
    ) -> Decision {
        Decision {
            key: input.key,
            pod_name: input.pod_name,
            current: input.current,
            desired,
            action,
            reason,
            timestamp: input.now,
        }
    }

    fn active_veto(
        &self,
        instance_id: &str,
        constraints: &PolicyConstraints,
        now: DateTime<Utc>,
    ) -> Option<DecisionReason> {
        let state = self.cooldowns.get(instance_id)?;
        if let Some(until) = state.backoff_until {
            if now < until {
                return Some(DecisionReason::Cooldown);
            }
        }
        if let Some(last) = state.last_commit {
            let cooldown = ChronoDuration::from_std(constraints.cooldown()).ok()?;
            if now < last + cooldown {
                return Some(DecisionReason::Cooldown);
            }
        }
        None
    }

    /// Record a successful commit: starts the cooldown, resets back-off.
    /// Happens-before the next sweep's read of the same instance.
    pub fn record_commit(&self, instance_id: &str, now: DateTime<Utc>) {
        let mut state = self.cooldowns.entry(instance_id.to_string()).or_default();
        state.last_commit = Some(now);
        state.backoff = Duration::ZERO;
        state.backoff_until = None;
    }

    /// Record a fatal executor failure: extends the instance's back-off
    /// exponentially (capped). Returns the back-off applied.
    pub fn record_fatal_failure(&self, instance_id: &str, now: DateTime<Utc>) -> Duration {
        let mut state = self.cooldowns.entry(instance_id.to_string()).or_default();
        state.backoff = if state.backoff.is_zero() {
            BACKOFF_BASE
        } else {
            (state.backoff * 2).min(BACKOFF_CAP)
        };
        state.backoff_until =
            Some(now + ChronoDuration::from_std(state.backoff).unwrap_or_default());
        state.backoff
    }

    /// Drop state for an instance that disappeared.
    pub fn evict(&self, instance_id: &str) {
        self.cooldowns.remove(instance_id);
    }
}

fn clamp_step(current: u64, desired: u64, step: f64) -> u64 {
    let low = (current as f64 * (1.0 - step)).floor() as u64;
    let high = (current as f64 * (1.0 + step)).ceil() as u64;
    desired.clamp(low, high)
}

/// Max-step clamp for memory, re-aligned to MiB afterwards.
fn mib_step(current: u64, desired: u64, step: f64) -> u64 {
    let clamped = clamp_step(current, desired, step);
    if clamped == desired { desired } else { ceil_to_mib(clamped) }
}
