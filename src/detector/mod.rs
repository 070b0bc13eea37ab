//! Pluggable detectors keyed by algorithm tag.
//!
//! Detectors are synchronous, CPU-bound black boxes. Scorers turn one
//! channel's values into a score per value; classifiers label every segment
//! of a set as normal or abnormal.

pub mod ewma;
pub mod nearest_normal;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AnalysisError, Result};
use crate::models::{AnalysisType, Parameters, Segment, SegmentClass};
use crate::signal::DistanceMatrix;

pub use ewma::EwmaScorer;
pub use nearest_normal::NearestNormalClassifier;

// ── Traits ──────────────────────────────────────────────────────────────

pub trait ScoringDetector: Send + Sync {
    /// Scores `values`. The result may have any length; callers resample it
    /// onto the input.
    fn score(&self, parameters: &Parameters, values: &[f64]) -> anyhow::Result<Vec<f64>>;
}

/// Segments of one channel across a bucket, with their pairwise distances.
pub struct SegmentSet {
    pub segments: Vec<Segment>,
    pub distances: Arc<DistanceMatrix>,
}

impl SegmentSet {
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

pub trait SegmentClassifier: Send + Sync {
    /// Returns one label per segment, in segment order.
    fn classify(&self, parameters: &Parameters, set: &SegmentSet) -> anyhow::Result<Vec<SegmentClass>>;
}

// ── Parameter helpers ───────────────────────────────────────────────────

pub(crate) fn param_f64(parameters: &Parameters, name: &str, default: f64) -> anyhow::Result<f64> {
    match parameters.get(name) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("parameter '{name}' must be a number, got {v}")),
    }
}

// ── Registry ────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct DetectorRegistry {
    scorers: HashMap<String, Arc<dyn ScoringDetector>>,
    classifiers: HashMap<String, Arc<dyn SegmentClassifier>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `EWMA` and `NEAREST_NORMAL`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_scorer(ewma::KEY, Arc::new(EwmaScorer));
        registry.register_classifier(nearest_normal::KEY, Arc::new(NearestNormalClassifier));
        registry
    }

    pub fn register_scorer(&mut self, key: &str, detector: Arc<dyn ScoringDetector>) {
        self.scorers.insert(key.to_string(), detector);
    }

    pub fn register_classifier(&mut self, key: &str, classifier: Arc<dyn SegmentClassifier>) {
        self.classifiers.insert(key.to_string(), classifier);
    }

    pub fn scorer(&self, key: &str) -> Result<Arc<dyn ScoringDetector>> {
        self.scorers
            .get(key)
            .cloned()
            .ok_or_else(|| AnalysisError::UnknownAlgorithm(key.to_string()))
    }

    pub fn classifier(&self, key: &str) -> Result<Arc<dyn SegmentClassifier>> {
        self.classifiers
            .get(key)
            .cloned()
            .ok_or_else(|| AnalysisError::UnknownAlgorithm(key.to_string()))
    }

    /// Checks that `key` names a detector of the given type.
    pub fn validate(&self, key: &str, algorithm_type: AnalysisType) -> Result<()> {
        let known = match algorithm_type {
            AnalysisType::Scoring => self.scorers.contains_key(key),
            AnalysisType::Classification => self.classifiers.contains_key(key),
        };
        if known {
            Ok(())
        } else {
            Err(AnalysisError::UnknownAlgorithm(key.to_string()))
        }
    }

    pub fn keys(&self, algorithm_type: AnalysisType) -> Vec<String> {
        let mut keys: Vec<String> = match algorithm_type {
            AnalysisType::Scoring => self.scorers.keys().cloned().collect(),
            AnalysisType::Classification => self.classifiers.keys().cloned().collect(),
        };
        keys.sort();
        keys
    }
}
