use super::{ScoringDetector, param_f64};
use crate::models::Parameters;

pub const KEY: &str = "EWMA";

const WARMUP: usize = 12;

/// Exponentially weighted moving average scorer.
///
/// Scores every point with its deviation from the running mean in units of
/// the running standard deviation. Points outside `sensitivity` standard
/// deviations are not folded into the running statistics.
///
/// Parameters: `alpha` (smoothing, default 0.25), `sensitivity` (default 3.0).
pub struct EwmaScorer;

impl ScoringDetector for EwmaScorer {
    fn score(&self, parameters: &Parameters, values: &[f64]) -> anyhow::Result<Vec<f64>> {
        let alpha = param_f64(parameters, "alpha", 0.25)?;
        let sensitivity = param_f64(parameters, "sensitivity", 3.0)?;
        if !(0.0..=1.0).contains(&alpha) || alpha == 0.0 {
            anyhow::bail!("alpha must be in (0, 1], got {alpha}");
        }
        if sensitivity <= 0.0 {
            anyhow::bail!("sensitivity must be positive, got {sensitivity}");
        }
        Ok(ewma_deviation(values, alpha, sensitivity))
    }
}

fn ewma_deviation(data: &[f64], alpha: f64, sensitivity: f64) -> Vec<f64> {
    let warmup = WARMUP.min(data.len());
    if warmup == 0 {
        return Vec::new();
    }

    let mut mean = data[..warmup].iter().sum::<f64>() / warmup as f64;
    let mut variance = data[..warmup].iter().map(|v| (v - mean).powi(2)).sum::<f64>() / warmup as f64;
    let min_var = variance * 0.3;

    let mut scores = Vec::with_capacity(data.len());
    for (i, &val) in data.iter().enumerate() {
        let std = variance.sqrt();
        let deviation = if std > 0.0 { (val - mean).abs() / std } else { 0.0 };
        scores.push(deviation);

        let is_anomaly = i >= warmup && deviation > sensitivity;
        if i > 0 && !is_anomaly {
            let diff = val - mean;
            mean = alpha * val + (1.0 - alpha) * mean;
            let va = alpha * 0.25;
            variance = (va * diff * diff + (1.0 - va) * variance).max(min_var);
        }
    }
    scores
}
