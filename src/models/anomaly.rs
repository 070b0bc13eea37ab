use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub ts_id: String,
    pub bucket_id: String,
    pub channel: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub length: i64,
    pub score: f64,
    pub keep: bool,
    pub bookmark: bool,
    pub manual: bool,
    pub rating: i64,
    pub views: i64,
}

/// An anomaly found by extraction, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnomaly {
    pub ts_id: String,
    pub bucket_id: String,
    pub channel: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub length: i64,
    pub score: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualAnomalyRequest {
    pub ts_id: String,
    pub channel: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAnomalyRequest {
    pub rating: Option<i64>,
    pub keep: Option<bool>,
    pub bookmark: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub bucket_id: Option<String>,
    pub ts_id: Option<String>,
    pub only_kept: bool,
    pub only_manual: bool,
    pub only_bookmarked: bool,
}

impl AnomalyFilter {
    pub fn bucket(bucket_id: &str) -> Self {
        Self {
            bucket_id: Some(bucket_id.to_string()),
            ..Default::default()
        }
    }

    pub fn series(ts_id: &str) -> Self {
        Self {
            ts_id: Some(ts_id.to_string()),
            ..Default::default()
        }
    }
}

/// Normal marking for one segment of a series channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nominal {
    pub id: String,
    pub ts_id: String,
    pub channel: String,
    pub granularity: super::bucket::Granularity,
    /// Truncated-date label, `None` when the bucket segments at `full`.
    pub date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NominalToggle {
    Added,
    Removed,
}
