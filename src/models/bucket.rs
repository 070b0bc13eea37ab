use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AnalysisError;

/// Whether a bucket (or an algorithm) produces continuous scores or segment labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    Scoring,
    Classification,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Scoring => "scoring",
            AnalysisType::Classification => "classification",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scoring" => Ok(AnalysisType::Scoring),
            "classification" => Ok(AnalysisType::Classification),
            other => Err(AnalysisError::invalid(
                "type",
                format!("'{other}' is neither 'scoring' nor 'classification'"),
            )),
        }
    }
}

/// Segment boundaries used for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Full,
    Month,
    Day,
    Hour,
    Minute,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Full => "full",
            Granularity::Month => "month",
            Granularity::Day => "day",
            Granularity::Hour => "hour",
            Granularity::Minute => "minute",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Granularity::Full),
            "month" => Ok(Granularity::Month),
            "day" => Ok(Granularity::Day),
            "hour" => Ok(Granularity::Hour),
            "minute" => Ok(Granularity::Minute),
            other => Err(AnalysisError::invalid(
                "classification_granularity",
                format!("unknown granularity '{other}'"),
            )),
        }
    }
}

/// How per-algorithm segment labels are combined when extracting anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationEnsemble {
    Majority,
    Max,
}

impl ClassificationEnsemble {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationEnsemble::Majority => "majority",
            ClassificationEnsemble::Max => "max",
        }
    }
}

impl FromStr for ClassificationEnsemble {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "majority" => Ok(ClassificationEnsemble::Majority),
            "max" => Ok(ClassificationEnsemble::Max),
            other => Err(AnalysisError::invalid(
                "classification_ensemble",
                format!("unknown ensemble method '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub bucket_type: AnalysisType,
    pub classification_granularity: Granularity,
    pub threshold: f64,
    pub smoothing_window: usize,
    pub classification_ensemble: ClassificationEnsemble,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBucketRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub bucket_type: String,
    #[serde(default = "default_granularity")]
    pub classification_granularity: String,
}

impl CreateBucketRequest {
    /// Parses the textual fields. Scoring buckets always segment at `full`.
    pub fn parse(&self) -> Result<(AnalysisType, Granularity), AnalysisError> {
        let bucket_type: AnalysisType = self.bucket_type.parse()?;
        let granularity = match bucket_type {
            AnalysisType::Scoring => Granularity::Full,
            AnalysisType::Classification => self.classification_granularity.parse()?,
        };
        Ok((bucket_type, granularity))
    }
}

fn default_granularity() -> String {
    "full".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoring_bucket_forces_full_granularity() {
        let req = CreateBucketRequest {
            name: "sensors".into(),
            bucket_type: "scoring".into(),
            classification_granularity: "hour".into(),
        };
        let (kind, granularity) = req.parse().unwrap();
        assert_eq!(kind, AnalysisType::Scoring);
        assert_eq!(granularity, Granularity::Full);
    }

    #[test]
    fn test_classification_bucket_keeps_granularity() {
        let req = CreateBucketRequest {
            name: "sensors".into(),
            bucket_type: "classification".into(),
            classification_granularity: "day".into(),
        };
        assert_eq!(req.parse().unwrap().1, Granularity::Day);
    }

    #[test]
    fn test_invalid_granularity_is_configuration_error() {
        let req = CreateBucketRequest {
            name: "sensors".into(),
            bucket_type: "classification".into(),
            classification_granularity: "fortnight".into(),
        };
        let err = req.parse().unwrap_err();
        assert!(err.is_configuration());
    }
}
