use super::{SegmentClassifier, SegmentSet, param_f64};
use crate::models::{Parameters, SegmentClass};

pub const KEY: &str = "NEAREST_NORMAL";

/// Labels a segment abnormal when its distance to the closest normal segment
/// exceeds `ratio_threshold` (default 2.0) times the typical spacing among
/// normal segments. Segments marked normal stay normal. Without any normal
/// segment everything is normal.
pub struct NearestNormalClassifier;

impl SegmentClassifier for NearestNormalClassifier {
    fn classify(&self, parameters: &Parameters, set: &SegmentSet) -> anyhow::Result<Vec<SegmentClass>> {
        let ratio = param_f64(parameters, "ratio_threshold", 2.0)?;
        if ratio <= 0.0 {
            anyhow::bail!("ratio_threshold must be positive, got {ratio}");
        }
        if set.distances.len() != set.len() {
            anyhow::bail!(
                "distance matrix covers {} segments, set has {}",
                set.distances.len(),
                set.len()
            );
        }

        let normals: Vec<usize> = (0..set.len()).filter(|&i| set.segments[i].normal).collect();
        if normals.is_empty() {
            return Ok(vec![SegmentClass::Normal; set.len()]);
        }

        let nearest_normal = |i: usize| {
            normals
                .iter()
                .filter(|&&j| j != i)
                .map(|&j| set.distances.get(i, j))
                .fold(f64::INFINITY, f64::min)
        };

        let candidates: Vec<usize> = if normals.len() >= 2 {
            normals.clone()
        } else {
            (0..set.len()).filter(|i| !set.segments[*i].normal).collect()
        };
        let spacing: Vec<f64> = candidates
            .iter()
            .map(|&i| nearest_normal(i))
            .filter(|d| d.is_finite())
            .collect();
        let reference = if spacing.is_empty() {
            0.0
        } else {
            spacing.iter().sum::<f64>() / spacing.len() as f64
        };

        Ok((0..set.len())
            .map(|i| {
                if set.segments[i].normal {
                    return SegmentClass::Normal;
                }
                let d = nearest_normal(i);
                if d > f64::EPSILON && d > ratio * reference {
                    SegmentClass::Abnormal
                } else {
                    SegmentClass::Normal
                }
            })
            .collect())
    }
}
