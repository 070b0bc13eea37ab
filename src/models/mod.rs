pub mod algorithm;
pub mod anomaly;
pub mod bucket;
pub mod job;
pub mod segment;
pub mod timeseries;

pub use algorithm::{Algorithm, Parameters, UpdateAlgorithmRequest};
pub use anomaly::{
    Anomaly, AnomalyFilter, ManualAnomalyRequest, NewAnomaly, Nominal, NominalToggle,
    UpdateAnomalyRequest,
};
pub use bucket::{AnalysisType, Bucket, ClassificationEnsemble, CreateBucketRequest, Granularity};
pub use job::JobStatus;
pub use segment::{Segment, SegmentClass};
pub use timeseries::{
    AnomalyClassification, AnomalyScore, Baseline, DataPoint, TimeSeries, TimeWindow,
};
