//! Exponential smoothing forecasting.

use super::{Algorithm, Model, PredictionResult};

/// Single exponential smoothing. The forecast is the final smoothed level;
/// confidence is variance-normalised: one minus the ratio of one-step
/// residual variance to the variance of the series itself.
pub struct ExponentialSmoothing {
    pub alpha: f64,
}

impl Default for ExponentialSmoothing {
    fn default() -> Self {
        Self { alpha: 0.3 }
    }
}

struct SmoothedLevel {
    level: f64,
    confidence: f64,
}

impl Algorithm for ExponentialSmoothing {
    fn name(&self) -> &'static str {
        "exponential-smoothing"
    }

    fn fit(&self, samples: &[(f64, f64)]) -> Option<Box<dyn Model>> {
        if samples.len() < self.min_samples() {
            return None;
        }

        let mut level = samples[0].1;
        let mut residuals = Vec::with_capacity(samples.len() - 1);
        for (_, v) in &samples[1..] {
            residuals.push(v - level);
            level = self.alpha * v + (1.0 - self.alpha) * level;
        }

        let n = samples.len() as f64;
        let mean = samples.iter().map(|(_, v)| v).sum::<f64>() / n;
        let series_var = samples
            .iter()
            .map(|(_, v)| (v - mean) * (v - mean))
            .sum::<f64>()
            / n;
        let residual_var =
            residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64;

        let confidence = if series_var == 0.0 {
            // Constant series: residuals are zero too, perfect fit
            1.0
        } else {
            (1.0 - residual_var / series_var).clamp(0.0, 1.0)
        };

        Some(Box::new(SmoothedLevel { level, confidence }))
    }
}

impl Model for SmoothedLevel {
    fn forecast(&self, _horizon_seconds: f64) -> PredictionResult {
        PredictionResult {
            predicted_value: self.level.max(0.0),
            confidence: self.confidence,
            method: "exponential-smoothing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_series_forecasts_level_with_full_confidence() {
        let samples: Vec<(f64, f64)> = (0..12).map(|i| (i as f64 * 10.0, 256.0)).collect();
        let model = ExponentialSmoothing::default().fit(&samples).unwrap();
        let result = model.forecast(60.0);
        assert!((result.predicted_value - 256.0).abs() < 1e-9);
        assert!((result.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_level_tracks_recent_values() {
        let mut samples: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 100.0)).collect();
        samples.extend((10..20).map(|i| (i as f64, 400.0)));
        let model = ExponentialSmoothing::default().fit(&samples).unwrap();
        let result = model.forecast(60.0);
        // Level should have moved well past the old plateau
        assert!(result.predicted_value > 250.0);
    }

    #[test]
    fn test_erratic_series_has_low_confidence() {
        let samples = vec![
            (0.0, 10.0),
            (1.0, 500.0),
            (2.0, 20.0),
            (3.0, 480.0),
            (4.0, 15.0),
            (5.0, 510.0),
        ];
        let model = ExponentialSmoothing::default().fit(&samples).unwrap();
        let result = model.forecast(1.0);
        assert!(result.confidence < 0.5);
    }
}
