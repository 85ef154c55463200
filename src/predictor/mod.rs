//! Pluggable demand forecasting.
//!
//! Each algorithm exposes the same capability set: fit a model over a sample
//! window, then forecast a horizon ahead with a reproducible confidence in
//! `[0, 1]`. Algorithms are registered in a map keyed by name and selected by
//! the `predictionMethod` config string; an unknown name is a validation
//! error at config load.
//!
//! The forecast is only ever consulted to *raise* a recommendation. That rule
//! lives in the calculator; this module just produces honest numbers.

mod linear;
mod moving_average;
mod smoothing;

pub use linear::LinearRegression;
pub use moving_average::MovingAverage;
pub use smoothing::ExponentialSmoothing;

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Minimum samples any method needs before it will claim confidence.
pub const MIN_SAMPLES: usize = 5;

/// A forecast with its confidence and the method that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionResult {
    /// Forecast value in the unit of the input series
    pub predicted_value: f64,
    /// Confidence in [0, 1]; 0 means "do not use"
    pub confidence: f64,
    pub method: &'static str,
}

impl PredictionResult {
    /// A forecast nobody should act on.
    pub fn unusable(method: &'static str) -> Self {
        Self {
            predicted_value: 0.0,
            confidence: 0.0,
            method,
        }
    }
}

/// A fitted model ready to forecast.
pub trait Model: Send + Sync {
    /// Forecast `horizon_seconds` past the end of the fitted window.
    fn forecast(&self, horizon_seconds: f64) -> PredictionResult;
}

/// A forecasting algorithm: `fit` produces a model, the model forecasts.
pub trait Algorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Samples required for a usable fit.
    fn min_samples(&self) -> usize {
        MIN_SAMPLES
    }

    /// Fit over `(seconds_offset, value)` pairs ordered by time.
    /// Returns `None` below the method's minimum sample count; callers treat
    /// that as a zero-confidence prediction.
    fn fit(&self, samples: &[(f64, f64)]) -> Option<Box<dyn Model>>;
}

static REGISTRY: Lazy<BTreeMap<&'static str, Arc<dyn Algorithm>>> = Lazy::new(|| {
    let mut map: BTreeMap<&'static str, Arc<dyn Algorithm>> = BTreeMap::new();
    let algos: [Arc<dyn Algorithm>; 3] = [
        Arc::new(LinearRegression),
        Arc::new(ExponentialSmoothing::default()),
        Arc::new(MovingAverage::default()),
    ];
    for algo in algos {
        map.insert(algo.name(), algo);
    }
    map
});

/// Look up an algorithm by its registered name.
pub fn by_name(name: &str) -> Option<Arc<dyn Algorithm>> {
    REGISTRY.get(name).cloned()
}

/// True when `name` is a registered algorithm.
pub fn is_registered(name: &str) -> bool {
    REGISTRY.contains_key(name)
}

/// Registered algorithm names, sorted.
pub fn names() -> Vec<&'static str> {
    REGISTRY.keys().copied().collect()
}

/// Fit-and-forecast in one call. Insufficient data yields confidence 0.
pub fn forecast(algo: &dyn Algorithm, samples: &[(f64, f64)], horizon_seconds: f64) -> PredictionResult {
    match algo.fit(samples) {
        Some(model) => {
            let mut result = model.forecast(horizon_seconds);
            // Contract: confidence never leaves [0, 1]
            result.confidence = result.confidence.clamp(0.0, 1.0);
            result
        }
        None => PredictionResult::unusable(algo.name()),
    }
}
