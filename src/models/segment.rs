use chrono::{DateTime, Utc};
use serde::Serialize;

/// Contiguous window of one series channel, the unit of classification.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub ts_id: String,
    pub channel: String,
    pub label: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub values: Vec<f64>,
    /// Marked normal by a nominal.
    pub normal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentClass {
    Normal,
    Abnormal,
}
