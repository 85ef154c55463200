//! Ordinary least-squares trend forecasting.

use super::{Algorithm, Model, PredictionResult};

/// Least-squares line fit over the window; confidence is the fit's R².
pub struct LinearRegression;

struct FittedLine {
    slope: f64,
    intercept: f64,
    last_t: f64,
    r_squared: f64,
}

impl Algorithm for LinearRegression {
    fn name(&self) -> &'static str {
        "linear-regression"
    }

    fn fit(&self, samples: &[(f64, f64)]) -> Option<Box<dyn Model>> {
        if samples.len() < self.min_samples() {
            return None;
        }

        let n = samples.len() as f64;
        let mean_t = samples.iter().map(|(t, _)| t).sum::<f64>() / n;
        let mean_v = samples.iter().map(|(_, v)| v).sum::<f64>() / n;

        let mut ss_tt = 0.0;
        let mut ss_tv = 0.0;
        for (t, v) in samples {
            ss_tt += (t - mean_t) * (t - mean_t);
            ss_tv += (t - mean_t) * (v - mean_v);
        }

        // Degenerate time axis (all samples at one instant)
        if ss_tt == 0.0 {
            return None;
        }

        let slope = ss_tv / ss_tt;
        let intercept = mean_v - slope * mean_t;

        let ss_tot: f64 = samples.iter().map(|(_, v)| (v - mean_v) * (v - mean_v)).sum();
        let ss_res: f64 = samples
            .iter()
            .map(|(t, v)| {
                let fitted = slope * t + intercept;
                (v - fitted) * (v - fitted)
            })
            .sum();

        // A flat series fits its own mean perfectly
        let r_squared = if ss_tot == 0.0 {
            1.0
        } else {
            (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
        };

        let last_t = samples.last().map(|(t, _)| *t).unwrap_or(0.0);

        Some(Box::new(FittedLine {
            slope,
            intercept,
            last_t,
            r_squared,
        }))
    }
}

impl Model for FittedLine {
    fn forecast(&self, horizon_seconds: f64) -> PredictionResult {
        let t = self.last_t + horizon_seconds;
        let predicted = (self.slope * t + self.intercept).max(0.0);
        PredictionResult {
            predicted_value: predicted,
            confidence: self.r_squared,
            method: "linear-regression",
        }
    }
}
