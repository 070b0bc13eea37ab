use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::bucket::AnalysisType;

/// Named detector options, passed to the detector untouched.
pub type Parameters = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Algorithm {
    pub id: String,
    pub bucket_id: String,
    pub name: String,
    /// Registry key of the detector backing this algorithm.
    pub algorithm: String,
    #[serde(rename = "type")]
    pub algorithm_type: AnalysisType,
    pub parameters: Parameters,
    pub weight: Option<f64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAlgorithmRequest {
    pub name: Option<String>,
    pub weight: Option<f64>,
    pub parameters: Option<Parameters>,
}
