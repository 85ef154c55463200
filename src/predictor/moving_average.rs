//! Moving-average forecasting.

use super::{Algorithm, Model, PredictionResult};

/// Mean of the most recent `window` samples. Confidence is one minus the
/// coefficient of variation of that tail, so a steady series scores high and
/// a spiky one scores near zero.
pub struct MovingAverage {
    pub window: usize,
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self { window: 10 }
    }
}

struct TailMean {
    mean: f64,
    confidence: f64,
}

impl Algorithm for MovingAverage {
    fn name(&self) -> &'static str {
        "moving-average"
    }

    fn fit(&self, samples: &[(f64, f64)]) -> Option<Box<dyn Model>> {
        if samples.len() < self.min_samples() {
            return None;
        }

        let tail_len = self.window.min(samples.len());
        let tail = &samples[samples.len() - tail_len..];

        let n = tail.len() as f64;
        let mean = tail.iter().map(|(_, v)| v).sum::<f64>() / n;
        let var = tail.iter().map(|(_, v)| (v - mean) * (v - mean)).sum::<f64>() / n;
        let stddev = var.sqrt();

        let confidence = if mean == 0.0 {
            if stddev == 0.0 { 1.0 } else { 0.0 }
        } else {
            (1.0 - stddev / mean).clamp(0.0, 1.0)
        };

        Some(Box::new(TailMean { mean, confidence }))
    }
}

impl Model for TailMean {
    fn forecast(&self, _horizon_seconds: f64) -> PredictionResult {
        PredictionResult {
            predicted_value: self.mean.max(0.0),
            confidence: self.confidence,
            method: "moving-average",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_series_forecasts_mean() {
        let samples: Vec<(f64, f64)> = (0..20).map(|i| (i as f64, 120.0)).collect();
        let model = MovingAverage::default().fit(&samples).unwrap();
        let result = model.forecast(30.0);
        assert!((result.predicted_value - 120.0).abs() < 1e-9);
        assert!((result.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_only_tail_window_counts() {
        // Old plateau at 1000, recent 10 samples at 100
        let mut samples: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 1000.0)).collect();
        samples.extend((10..20).map(|i| (i as f64, 100.0)));
        let model = MovingAverage::default().fit(&samples).unwrap();
        let result = model.forecast(30.0);
        assert!((result.predicted_value - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_spiky_tail_scores_low() {
        let samples = vec![
            (0.0, 10.0),
            (1.0, 400.0),
            (2.0, 5.0),
            (3.0, 390.0),
            (4.0, 8.0),
        ];
        let model = MovingAverage::default().fit(&samples).unwrap();
        let result = model.forecast(1.0);
        assert!(result.confidence < 0.3);
    }
}
