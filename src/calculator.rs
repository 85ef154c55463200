//! Pure envelope computation: usage aggregate + policy strategy + optional
//! prediction → desired requests/limits.
//!
//! The prediction is only consulted to raise a request: it must clear the
//! confidence threshold AND exceed the base recommendation, and it never
//! drives a downscale. Memory values are rounded up to the nearest 1 MiB to
//! avoid churn. An envelope that cannot satisfy its own invariants is
//! reported as infeasible and vetoed upstream.

use crate::policy::{ResourceFormula, SizingStrategy};
use crate::quantity::ceil_to_mib;
use crate::types::{ResourceEnvelope, UsageAggregate};

/// Error type for envelope computation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalcError {
    #[error("infeasible envelope: {0}")]
    Infeasible(String),
}

/// A forecast mapped to request level for one dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DimensionPrediction {
    /// Predicted request in canonical units
    pub request: u64,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

/// Per-dimension predictions feeding one envelope computation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnvelopePrediction {
    pub cpu: Option<DimensionPrediction>,
    pub memory: Option<DimensionPrediction>,
}

/// Compute the desired envelope for one container.
pub fn compute_envelope(
    usage: UsageAggregate,
    strategy: &SizingStrategy,
    prediction: Option<&EnvelopePrediction>,
    confidence_threshold: f64,
) -> Result<ResourceEnvelope, CalcError> {
    let cpu_prediction = prediction.and_then(|p| p.cpu);
    let mem_prediction = prediction.and_then(|p| p.memory);

    let (cpu_request, cpu_limit) = compute_dimension(
        usage.cpu_millicores,
        &strategy.cpu,
        cpu_prediction,
        confidence_threshold,
        "cpu",
        |v| v,
    )?;
    let (memory_request, memory_limit) = compute_dimension(
        usage.memory_bytes,
        &strategy.memory,
        mem_prediction,
        confidence_threshold,
        "memory",
        ceil_to_mib,
    )?;

    let envelope = ResourceEnvelope {
        cpu_request,
        cpu_limit,
        memory_request,
        memory_limit,
    };
    if !envelope.is_valid() {
        return Err(CalcError::Infeasible(format!(
            "computed envelope violates request<=limit: {envelope:?}"
        )));
    }
    Ok(envelope)
}

fn compute_dimension(
    usage: u64,
    formula: &ResourceFormula,
    prediction: Option<DimensionPrediction>,
    confidence_threshold: f64,
    dimension: &str,
    round: fn(u64) -> u64,
) -> Result<(u64, u64), CalcError> {
    let mut request = scaled(usage, formula.multiplier, formula.addition);

    // Prediction only ever raises the request, and only with enough
    // confidence; downscaling stays grounded in current usage.
    if let Some(p) = prediction {
        if p.confidence >= confidence_threshold && p.request > request {
            request = p.request;
        }
    }

    let request = round(request).clamp(formula.min_request, formula.max_request);

    let limit_raw = scaled(request, formula.limit_multiplier, formula.limit_addition);
    let limit_cap = formula.max_limit;
    if limit_cap < request {
        return Err(CalcError::Infeasible(format!(
            "{dimension}: maxLimit {limit_cap} below request {request}"
        )));
    }
    let limit = round(limit_raw).clamp(request, limit_cap);

    Ok((request, limit))
}

fn scaled(value: u64, multiplier: f64, addition: u64) -> u64 {
    (value as f64 * multiplier).round() as u64 + addition
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::MIB;

    fn strategy() -> SizingStrategy {
        SizingStrategy::default()
    }

    fn usage(cpu: u64, mem: u64) -> UsageAggregate {
        UsageAggregate {
            cpu_millicores: cpu,
            memory_bytes: mem,
        }
    }

    #[test]
    fn test_stable_workload_formula() {
        // p95 CPU 100m, multiplier 1.2 -> 120m request
        let env = compute_envelope(usage(100, 256 * MIB), &strategy(), None, 0.7).unwrap();
        assert_eq!(env.cpu_request, 120);
        assert_eq!(env.cpu_limit, 240);
        // Memory: 256Mi * 1.2 rounded up to MiB (308Mi)
        assert_eq!(env.memory_request, 308 * MIB);
        assert_eq!(env.memory_limit, env.memory_request);
        assert!(env.is_valid());
    }

    #[test]
    fn test_downscale_follows_usage_evidence() {
        // p95 dropped to 120m: 120 * 1.2 = 144m
        let env = compute_envelope(usage(120, 256 * MIB), &strategy(), None, 0.7).unwrap();
        assert_eq!(env.cpu_request, 144);
    }

    #[test]
    fn test_prediction_raises_request() {
        let base = compute_envelope(usage(100, 512 * MIB), &strategy(), None, 0.7).unwrap();
        let prediction = EnvelopePrediction {
            memory: Some(DimensionPrediction {
                request: 768 * MIB,
                confidence: 0.8,
            }),
            ..Default::default()
        };
        let env =
            compute_envelope(usage(100, 512 * MIB), &strategy(), Some(&prediction), 0.7).unwrap();
        assert_eq!(env.memory_request, 768 * MIB);
        assert!(env.memory_request > base.memory_request);
        // CPU dimension unaffected
        assert_eq!(env.cpu_request, base.cpu_request);
        // Limit derived after the substitution
        assert_eq!(env.memory_limit, 768 * MIB);
    }

    #[test]
    fn test_prediction_below_base_is_ignored() {
        let base = compute_envelope(usage(500, 512 * MIB), &strategy(), None, 0.7).unwrap();
        let prediction = EnvelopePrediction {
            memory: Some(DimensionPrediction {
                request: 256 * MIB,
                confidence: 0.9,
            }),
            ..Default::default()
        };
        let env =
            compute_envelope(usage(500, 512 * MIB), &strategy(), Some(&prediction), 0.7).unwrap();
        assert_eq!(env.memory_request, base.memory_request);
    }

    #[test]
    fn test_low_confidence_prediction_is_ignored() {
        let base = compute_envelope(usage(100, 512 * MIB), &strategy(), None, 0.7).unwrap();
        let prediction = EnvelopePrediction {
            memory: Some(DimensionPrediction {
                request: 768 * MIB,
                confidence: 0.5,
            }),
            ..Default::default()
        };
        let env =
            compute_envelope(usage(100, 512 * MIB), &strategy(), Some(&prediction), 0.7).unwrap();
        assert_eq!(env.memory_request, base.memory_request);
    }

    #[test]
    fn test_request_clamped_to_bounds() {
        let mut s = strategy();
        s.cpu.min_request = 200;
        s.cpu.max_request = 400;

        let env = compute_envelope(usage(10, 256 * MIB), &s, None, 0.7).unwrap();
        assert_eq!(env.cpu_request, 200);

        let env = compute_envelope(usage(5000, 256 * MIB), &s, None, 0.7).unwrap();
        assert_eq!(env.cpu_request, 400);
    }

    #[test]
    fn test_memory_rounds_up_to_mib() {
        let env = compute_envelope(usage(100, 100 * MIB + 1), &strategy(), None, 0.7).unwrap();
        assert_eq!(env.memory_request % MIB, 0);
        assert!(env.memory_request >= 120 * MIB);
    }

    #[test]
    fn test_infeasible_when_max_limit_below_request() {
        let mut s = strategy();
        s.cpu.min_request = 500;
        s.cpu.max_request = 1000;
        s.cpu.max_limit = 100;
        let err = compute_envelope(usage(800, 256 * MIB), &s, None, 0.7).unwrap_err();
        assert!(matches!(err, CalcError::Infeasible(_)));
    }

    #[test]
    fn test_limit_never_below_request() {
        let mut s = strategy();
        s.cpu.limit_multiplier = 1.0;
        s.cpu.limit_addition = 0;
        let env = compute_envelope(usage(100, 256 * MIB), &s, None, 0.7).unwrap();
        assert_eq!(env.cpu_limit, env.cpu_request);
    }
}
