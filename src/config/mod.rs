//! Configuration loading, precedence, validation, and hot reload.
//!
//! Precedence for every field: declarative config object > environment
//! variable (`RIGHTSIZER_*`) > compiled default. The active snapshot lives
//! behind an atomic pointer; writers assemble a new snapshot off-path and
//! swap it, readers take one reference per decision. A reload that fails
//! validation leaves the previous good snapshot in place.

pub mod types;

pub use types::{ClusterIdentity, ConfigFile, ConfigSnapshot};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Error type for configuration handling.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Unknown prediction method '{0}' (registered: {1})")]
    UnknownPredictionMethod(String, String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Duplicate policy name '{0}'")]
    DuplicatePolicyName(String),
}

const ENV_PREFIX: &str = "RIGHTSIZER_";

fn env_var<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .and_then(|v| v.parse().ok())
}

fn env_list(name: &str) -> Option<Vec<String>> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// Parse the declarative config object from a YAML file.
pub fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve a config file against environment overrides and compiled
/// defaults, then validate. `generation` stamps the resulting snapshot.
pub fn resolve(file: ConfigFile, generation: u64) -> Result<ConfigSnapshot, ConfigError> {
    let defaults = ConfigSnapshot::defaults();

    let mut default_constraints = defaults.default_constraints;
    if let Some(v) = file
        .scale_up_threshold
        .or_else(|| env_var("SCALE_UP_THRESHOLD"))
    {
        default_constraints.scale_up_threshold = v;
    }
    if let Some(v) = file
        .scale_down_threshold
        .or_else(|| env_var("SCALE_DOWN_THRESHOLD"))
    {
        default_constraints.scale_down_threshold = v;
    }
    if let Some(v) = file.cooldown.or_else(|| env_var("COOLDOWN")) {
        default_constraints.cooldown_seconds = v;
    }
    if let Some(v) = file
        .max_change_per_step
        .or_else(|| env_var("MAX_CHANGE_PER_STEP"))
    {
        default_constraints.max_change_per_step = v;
    }

    let snapshot = ConfigSnapshot {
        reconcile_interval: file
            .reconcile_interval
            .or_else(|| env_var("RECONCILE_INTERVAL"))
            .map(Duration::from_secs)
            .unwrap_or(defaults.reconcile_interval),
        max_concurrent_reconciles: file
            .max_concurrent_reconciles
            .or_else(|| env_var("MAX_CONCURRENT_RECONCILES"))
            .unwrap_or(defaults.max_concurrent_reconciles),
        qps: file.qps.or_else(|| env_var("QPS")).unwrap_or(defaults.qps),
        burst: file
            .burst
            .or_else(|| env_var("BURST"))
            .unwrap_or(defaults.burst),
        prediction_enabled: file
            .prediction_enabled
            .or_else(|| env_var("PREDICTION_ENABLED"))
            .unwrap_or(defaults.prediction_enabled),
        prediction_method: file
            .prediction_method
            .or_else(|| env_var("PREDICTION_METHOD"))
            .unwrap_or(defaults.prediction_method),
        prediction_confidence_threshold: file
            .prediction_confidence_threshold
            .or_else(|| env_var("PREDICTION_CONFIDENCE_THRESHOLD"))
            .unwrap_or(defaults.prediction_confidence_threshold),
        default_strategy: file.default_strategy.unwrap_or(defaults.default_strategy),
        default_constraints,
        default_mode: defaults.default_mode,
        namespace_include: file
            .namespace_include
            .or_else(|| env_list("NAMESPACE_INCLUDE"))
            .unwrap_or(defaults.namespace_include),
        namespace_exclude: file
            .namespace_exclude
            .or_else(|| env_list("NAMESPACE_EXCLUDE"))
            .unwrap_or(defaults.namespace_exclude),
        commit_budget_per_sweep: file
            .commit_budget_per_sweep
            .or_else(|| env_var("COMMIT_BUDGET_PER_SWEEP"))
            .unwrap_or(defaults.commit_budget_per_sweep),
        policies: file.policies,
        generation,
    };

    validate(&snapshot)?;
    Ok(snapshot)
}

fn validate(snapshot: &ConfigSnapshot) -> Result<(), ConfigError> {
    if !crate::predictor::is_registered(&snapshot.prediction_method) {
        return Err(ConfigError::UnknownPredictionMethod(
            snapshot.prediction_method.clone(),
            crate::predictor::names().join(", "),
        ));
    }

    let threshold = snapshot.prediction_confidence_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ConfigError::InvalidField {
            field: "predictionConfidenceThreshold",
            reason: format!("{threshold} is outside [0, 1]"),
        });
    }

    if snapshot.qps <= 0.0 {
        return Err(ConfigError::InvalidField {
            field: "qps",
            reason: "must be positive".to_string(),
        });
    }

    if snapshot.max_concurrent_reconciles == 0 {
        return Err(ConfigError::InvalidField {
            field: "maxConcurrentReconciles",
            reason: "must be at least 1".to_string(),
        });
    }

    if snapshot.reconcile_interval.is_zero() {
        return Err(ConfigError::InvalidField {
            field: "reconcileInterval",
            reason: "must be positive".to_string(),
        });
    }

    validate_strategy(&snapshot.default_strategy, "defaultStrategy")?;

    let mut seen = HashSet::new();
    for policy in &snapshot.policies {
        if !seen.insert(policy.name.as_str()) {
            return Err(ConfigError::DuplicatePolicyName(policy.name.clone()));
        }
        validate_strategy(&policy.strategy, "policy strategy")?;
    }

    Ok(())
}

fn validate_strategy(
    strategy: &crate::policy::SizingStrategy,
    field: &'static str,
) -> Result<(), ConfigError> {
    if !(0.0 < strategy.percentile && strategy.percentile <= 1.0) {
        return Err(ConfigError::InvalidField {
            field,
            reason: format!("percentile {} is outside (0, 1]", strategy.percentile),
        });
    }
    for formula in [&strategy.cpu, &strategy.memory] {
        if formula.multiplier <= 0.0 || formula.limit_multiplier < 1.0 {
            return Err(ConfigError::InvalidField {
                field,
                reason: "multiplier must be > 0 and limitMultiplier >= 1".to_string(),
            });
        }
        if formula.min_request == 0 || formula.min_request > formula.max_request {
            return Err(ConfigError::InvalidField {
                field,
                reason: "request bounds must satisfy 0 < min <= max".to_string(),
            });
        }
    }
    Ok(())
}

/// Thread-safe holder of the active config snapshot.
///
/// Readers are lock-free; `reload` swaps in a freshly-resolved snapshot and
/// keeps the previous one live when the new config fails validation.
pub struct ConfigStore {
    inner: ArcSwap<ConfigSnapshot>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Build the store from an optional config file path.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => read_file(p)?,
            None => ConfigFile::default(),
        };
        let snapshot = resolve(file, 1)?;
        Ok(Self {
            inner: ArcSwap::from_pointee(snapshot),
            path: path.map(Path::to_path_buf),
        })
    }

    /// Current snapshot. Hold the `Arc` for the duration of one decision.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    /// Re-read the config source and swap atomically. On failure the
    /// previous good snapshot stays active and the error is returned.
    pub fn reload(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(self.snapshot());
        };
        let generation = self.snapshot().generation + 1;
        let snapshot = resolve(read_file(path)?, generation)?;
        let snapshot = Arc::new(snapshot);
        self.inner.store(snapshot.clone());
        log::info!(
            "configuration reloaded (generation {}, {} policies)",
            snapshot.generation,
            snapshot.policies.len()
        );
        Ok(snapshot)
    }
}
