use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    pub id: String,
    pub bucket_id: String,
    pub name: String,
    pub channels: Vec<String>,
    pub created_at: String,
}

/// One timestamp with a value per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub value: f64,
}

/// A segment labelled positive by one classification algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyClassification {
    pub ts_id: String,
    pub algorithm_id: String,
    pub channel: String,
    /// Truncated-date label of the segment, `None` for full-series segments.
    pub date_trunc: Option<String>,
    pub granularity: super::bucket::Granularity,
}

/// Min/max of one algorithm's scores on one channel across a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub min: f64,
    pub max: f64,
}

impl Baseline {
    /// Maps `value` into the baseline range. A zero-width range maps to 0.
    pub fn normalize(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span <= 0.0 {
            return 0.0;
        }
        (value - self.min) / span
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimeWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub(crate) fn bounds_millis(&self) -> (i64, i64) {
        (
            self.from.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN),
            self.to.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX),
        )
    }
}
