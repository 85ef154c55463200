//! Configuration object model.
//!
//! `ConfigFile` mirrors the declarative config object: every field optional,
//! so absence falls through to an environment variable and then a compiled
//! default. `ConfigSnapshot` is the fully-resolved, immutable bundle handed
//! to the loop; readers hold one `Arc` per decision and never observe a mix
//! of old and new fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::{Policy, PolicyConstraints, PolicyMode, SizingStrategy};

/// The declarative config object as it appears on disk (all fields optional).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    /// Sweep period in seconds
    pub reconcile_interval: Option<u64>,
    /// Worker pool size
    pub max_concurrent_reconciles: Option<usize>,
    /// API client rate budget
    pub qps: Option<f64>,
    pub burst: Option<u32>,
    /// Enables the predictor
    pub prediction_enabled: Option<bool>,
    /// One of the registered algorithm names
    pub prediction_method: Option<String>,
    /// Minimum confidence for a forecast to influence an envelope
    pub prediction_confidence_threshold: Option<f64>,
    /// Strategy used when no policy matches an instance
    pub default_strategy: Option<SizingStrategy>,
    /// Instance scope
    pub namespace_include: Option<Vec<String>>,
    pub namespace_exclude: Option<Vec<String>>,
    /// Gate tunables for the default policy
    pub scale_up_threshold: Option<f64>,
    pub scale_down_threshold: Option<f64>,
    /// Cooldown in seconds
    pub cooldown: Option<u64>,
    pub max_change_per_step: Option<f64>,
    /// Global resize commits per sweep
    pub commit_budget_per_sweep: Option<usize>,
    /// Declarative sizing policies
    pub policies: Vec<Policy>,
}

/// Fully-resolved immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub reconcile_interval: Duration,
    pub max_concurrent_reconciles: usize,
    pub qps: f64,
    pub burst: u32,
    pub prediction_enabled: bool,
    pub prediction_method: String,
    pub prediction_confidence_threshold: f64,
    pub default_strategy: SizingStrategy,
    pub default_constraints: PolicyConstraints,
    pub default_mode: PolicyMode,
    pub namespace_include: Vec<String>,
    pub namespace_exclude: Vec<String>,
    pub commit_budget_per_sweep: usize,
    pub policies: Vec<Policy>,
    /// Advances on every successful reload; policy caches key off it
    pub generation: u64,
}

impl ConfigSnapshot {
    /// Compiled defaults, generation 0.
    pub fn defaults() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            max_concurrent_reconciles: num_cpus::get().clamp(2, 8),
            qps: 20.0,
            burst: 40,
            prediction_enabled: false,
            prediction_method: "linear-regression".to_string(),
            prediction_confidence_threshold: 0.7,
            default_strategy: SizingStrategy::default(),
            default_constraints: PolicyConstraints::default(),
            default_mode: PolicyMode::Advise,
            namespace_include: Vec::new(),
            namespace_exclude: Vec::new(),
            commit_budget_per_sweep: 20,
            policies: Vec::new(),
            generation: 0,
        }
    }
}

/// Identity labels read once at startup and attached to emitted metrics and
/// events; never recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub cluster_id: String,
    pub cluster_name: String,
    pub environment: String,
    pub operator_version: String,
}

impl ClusterIdentity {
    pub fn from_env() -> Self {
        Self {
            cluster_id: std::env::var("CLUSTER_ID").unwrap_or_else(|_| "unknown".to_string()),
            cluster_name: std::env::var("CLUSTER_NAME").unwrap_or_else(|_| "unknown".to_string()),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "unknown".to_string()),
            operator_version: std::env::var("OPERATOR_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}
