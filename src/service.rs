//! Caller-facing entry points.
//!
//! Every operation that can be rejected for configuration reasons (unknown
//! detector key, bad granularity, malformed label) is checked here, before
//! the store or the work queue is touched.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use crate::clustering::{
    self, ClusterSource, DEFAULT_BOOKMARK_DISTANCE, DEFAULT_LENGTH_TOLERANCE, RankedAnomaly, Recommendation,
    SimilarBookmark,
};
use crate::config::{AlgorithmTemplate, AnomalyScoresConfig, ScoutConfig};
use crate::detector::DetectorRegistry;
use crate::ensemble::{self, AlgorithmRatio, QueryPoint, SeriesListView, SeriesQuery};
use crate::error::{AnalysisError, Result};
use crate::extraction;
use crate::models::{
    Algorithm, AnalysisType, Anomaly, AnomalyFilter, Bucket, ClassificationEnsemble,
    CreateBucketRequest, DataPoint, Granularity, JobStatus, ManualAnomalyRequest, Nominal,
    NominalToggle, Parameters, TimeSeries, TimeWindow, UpdateAlgorithmRequest,
    UpdateAnomalyRequest,
};
use crate::queue::JobQueue;
use crate::segments::label_range;
use crate::store::Store;

#[derive(Clone)]
pub struct AnalysisService {
    store: Arc<Store>,
    queue: JobQueue,
    registry: Arc<DetectorRegistry>,
    defaults: AnomalyScoresConfig,
    templates: Vec<AlgorithmTemplate>,
}

impl AnalysisService {
    pub fn new(
        store: Arc<Store>,
        queue: JobQueue,
        registry: Arc<DetectorRegistry>,
        config: &ScoutConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            defaults: config.anomaly_scores.clone(),
            templates: config.algorithms.clone(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ── Buckets ──

    /// Creates a bucket with the configured default algorithms of its type.
    pub fn create_bucket(&self, req: &CreateBucketRequest) -> Result<String> {
        let (bucket_type, granularity) = req.parse()?;
        let templates: Vec<AlgorithmTemplate> = self
            .templates
            .iter()
            .filter(|t| t.algorithm_type == bucket_type)
            .cloned()
            .collect();
        for template in &templates {
            self.registry.validate(&template.key, template.algorithm_type)?;
        }
        let id = self.store.create_bucket(
            &req.name,
            bucket_type,
            granularity,
            self.defaults.threshold,
            self.defaults.smoothing_window,
            &templates,
        )?;
        tracing::info!(
            bucket_id = %id,
            "service: created {bucket_type} bucket '{}' ({} default algorithms)",
            req.name,
            templates.len()
        );
        Ok(id)
    }

    pub fn list_buckets(&self) -> Result<Vec<Bucket>> {
        self.store.list_buckets()
    }

    pub fn get_bucket(&self, id: &str) -> Result<Bucket> {
        self.store.get_bucket(id)
    }

    pub fn rename_bucket(&self, id: &str, name: &str) -> Result<()> {
        self.store.rename_bucket(id, name)
    }

    pub fn set_threshold(&self, id: &str, threshold: f64) -> Result<()> {
        if !threshold.is_finite() {
            return Err(AnalysisError::invalid("threshold", "must be a finite number"));
        }
        self.store.set_threshold(id, threshold)
    }

    pub fn set_smoothing_window(&self, id: &str, window: usize) -> Result<()> {
        self.store.set_smoothing_window(id, window)
    }

    pub fn set_classification_ensemble(&self, id: &str, method: &str) -> Result<()> {
        let method: ClassificationEnsemble = method.parse()?;
        self.store.set_classification_ensemble(id, method)
    }

    /// Deletes the bucket and drops it from the queue and status store.
    pub fn delete_bucket(&self, id: &str) -> Result<bool> {
        let removed = self.queue.remove_all(id)?;
        if removed > 0 {
            tracing::info!(bucket_id = %id, "service: dropped {removed} queued runs of deleted bucket");
        }
        self.queue.reset(id)?;
        self.store.delete_bucket(id)
    }

    pub fn bucket_channels(&self, id: &str) -> Result<Vec<String>> {
        self.store.bucket_channels(id)
    }

    // ── Algorithms ──

    pub fn add_algorithm(
        &self,
        bucket_id: &str,
        key: &str,
        name: &str,
        algorithm_type: AnalysisType,
        parameters: &Parameters,
        weight: Option<f64>,
    ) -> Result<String> {
        self.registry.validate(key, algorithm_type)?;
        check_weight(weight)?;
        self.store.get_bucket(bucket_id)?;
        self.store
            .add_algorithm(bucket_id, key, name, algorithm_type, parameters, weight)
    }

    pub fn list_algorithms(&self, bucket_id: &str) -> Result<Vec<Algorithm>> {
        self.store.list_algorithms(bucket_id)
    }

    pub fn update_algorithm(&self, id: &str, update: &UpdateAlgorithmRequest) -> Result<()> {
        check_weight(update.weight)?;
        self.store.update_algorithm(id, update)
    }

    pub fn delete_algorithm(&self, id: &str) -> Result<bool> {
        self.store.delete_algorithm(id)
    }

    // ── Time series ──

    pub fn create_time_series(&self, bucket_id: &str, name: &str, channels: &[String]) -> Result<String> {
        if channels.is_empty() {
            return Err(AnalysisError::invalid("channels", "at least one channel is required"));
        }
        self.store.get_bucket(bucket_id)?;
        self.store.create_time_series(bucket_id, name, channels)
    }

    pub fn import_points(&self, ts_id: &str, points: &[DataPoint]) -> Result<usize> {
        let count = self.store.append_points(ts_id, points)?;
        tracing::debug!("service: imported {count} points into {ts_id}");
        Ok(count)
    }

    pub fn list_time_series(&self, bucket_id: &str) -> Result<Vec<TimeSeries>> {
        self.store.list_time_series(bucket_id)
    }

    pub fn rename_time_series(&self, id: &str, name: &str) -> Result<()> {
        self.store.rename_time_series(id, name)
    }

    pub fn delete_time_series(&self, id: &str) -> Result<bool> {
        self.store.delete_time_series(id)
    }

    pub fn points(
        &self,
        ts_id: &str,
        channel: &str,
        window: &TimeWindow,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        self.store.channel_points(ts_id, channel, window)
    }

    // ── Calculation queue ──

    /// Queues a recompute of the bucket. Every algorithm of the bucket must
    /// resolve in the registry; otherwise nothing is queued.
    pub fn enqueue(&self, bucket_id: &str) -> Result<bool> {
        self.store.get_bucket(bucket_id)?;
        for algorithm in self.store.list_algorithms(bucket_id)? {
            self.registry.validate(&algorithm.algorithm, algorithm.algorithm_type)?;
        }
        let queued = self.queue.enqueue(bucket_id)?;
        if queued {
            tracing::info!(bucket_id = %bucket_id, "service: calculation queued");
        }
        Ok(queued)
    }

    pub fn status(&self, bucket_id: &str) -> Result<JobStatus> {
        self.queue.status(bucket_id)
    }

    pub fn reset_status(&self, bucket_id: &str) -> Result<()> {
        self.queue.reset(bucket_id)
    }

    pub fn queued(&self) -> Result<Vec<String>> {
        self.queue.list()
    }

    pub fn errored(&self, bucket_id: &str) -> Result<Option<String>> {
        self.queue.errored(bucket_id)
    }

    // ── Queries ──

    pub fn query_series(&self, query: &SeriesQuery) -> Result<Vec<QueryPoint>> {
        ensemble::query_series(&self.store, query)
    }

    pub fn query_series_list(
        &self,
        ts_ids: &[String],
        channel: &str,
        n_segments: Option<usize>,
    ) -> Result<SeriesListView> {
        ensemble::query_series_list(&self.store, ts_ids, channel, n_segments)
    }

    pub fn algorithm_score_ratios(
        &self,
        ts_ids: &[String],
        channel: &str,
        n_segments: Option<usize>,
    ) -> Result<Vec<AlgorithmRatio>> {
        ensemble::algorithm_score_ratios(&self.store, ts_ids, channel, n_segments)
    }

    pub fn classification_ratios(&self, ts_ids: &[String], channel: &str) -> Result<Vec<AlgorithmRatio>> {
        ensemble::classification_ratios(&self.store, ts_ids, channel)
    }

    pub fn max_score_curve(&self, ts_ids: &[String], channel: &str, n_segments: usize) -> Result<Vec<f64>> {
        ensemble::max_score_curve(&self.store, ts_ids, channel, n_segments)
    }

    // ── Anomalies ──

    pub fn extract_anomalies(&self, ts_id: &str) -> Result<usize> {
        extraction::extract_anomalies(&self.store, ts_id)
    }

    pub fn extract_bucket_anomalies(&self, bucket_id: &str) -> Result<usize> {
        extraction::extract_bucket_anomalies(&self.store, bucket_id)
    }

    pub fn add_manual_anomaly(&self, req: &ManualAnomalyRequest) -> Result<Option<String>> {
        let ts = self.store.get_time_series(&req.ts_id)?;
        if !ts.channels.iter().any(|c| c == &req.channel) {
            return Err(AnalysisError::invalid(
                "channel",
                format!("'{}' is not a channel of series '{}'", req.channel, ts.name),
            ));
        }
        self.store.add_manual_anomaly(req)
    }

    pub fn get_anomaly(&self, id: &str) -> Result<Anomaly> {
        let anomaly = self.store.get_anomaly(id)?;
        self.store.increase_views(id)?;
        Ok(anomaly)
    }

    pub fn update_anomaly(&self, id: &str, update: &UpdateAnomalyRequest) -> Result<()> {
        self.store.update_anomaly(id, update)
    }

    pub fn delete_anomaly(&self, id: &str) -> Result<()> {
        self.store.delete_anomaly(id)
    }

    /// Removes the unkept anomalies of a series.
    pub fn clear_anomalies(&self, ts_id: &str) -> Result<usize> {
        self.store.delete_anomalies(ts_id, false)
    }

    pub fn list_anomalies(&self, filter: &AnomalyFilter) -> Result<Vec<RankedAnomaly>> {
        clustering::anomalies_with_severity(&self.store, filter)
    }

    pub fn severity_ranking(&self, bucket_id: &str) -> Result<Vec<(String, f64)>> {
        clustering::severity_ranking(&self.store, bucket_id)
    }

    pub fn cluster(&self, bucket_id: &str, source: &ClusterSource) -> Result<Option<Arc<Value>>> {
        self.store.get_bucket(bucket_id)?;
        clustering::cluster(&self.store, bucket_id, source)
    }

    pub fn dissimilar_recommendations(&self, bucket_id: &str, k: usize, only_unrated: bool) -> Result<Vec<Recommendation>> {
        clustering::dissimilar_recommendations(&self.store, bucket_id, k, only_unrated)
    }

    pub fn estimate_ratings(&self, bucket_id: &str, k: usize) -> Result<Vec<(String, f64)>> {
        clustering::estimate_ratings(&self.store, bucket_id, k)
    }

    /// Bookmarks resembling the anomaly, with the default distance and
    /// length tolerance when not given.
    pub fn find_similar_bookmarks(
        &self,
        anomaly_id: &str,
        max_distance: Option<f64>,
        length_tolerance: Option<f64>,
    ) -> Result<Vec<SimilarBookmark>> {
        let max_distance = max_distance.unwrap_or(DEFAULT_BOOKMARK_DISTANCE);
        let length_tolerance = length_tolerance.unwrap_or(DEFAULT_LENGTH_TOLERANCE);
        for (field, value) in [("max_distance", max_distance), ("length_tolerance", length_tolerance)] {
            if !value.is_finite() || value < 0.0 {
                return Err(AnalysisError::invalid(field, format!("{value} is not a non-negative number")));
            }
        }
        clustering::find_similar_bookmarks(&self.store, anomaly_id, max_distance, length_tolerance)
    }

    pub fn reset_ratings(&self, bucket_id: &str) -> Result<usize> {
        self.store.get_bucket(bucket_id)?;
        self.store.reset_ratings(bucket_id)
    }

    pub fn reset_views(&self, bucket_id: &str) -> Result<usize> {
        self.store.get_bucket(bucket_id)?;
        self.store.reset_views(bucket_id)
    }

    // ── Nominals ──

    /// Toggles the normal marking of a segment. `date` is the segment label
    /// at the bucket's granularity and must be absent for `full` buckets.
    pub fn toggle_nominal(&self, ts_id: &str, channel: &str, date: Option<&str>) -> Result<NominalToggle> {
        let ts = self.store.get_time_series(ts_id)?;
        let bucket = self.store.get_bucket(&ts.bucket_id)?;
        let granularity = bucket.classification_granularity;
        match (granularity, date) {
            (Granularity::Full, None) => {}
            (Granularity::Full, Some(_)) => {
                return Err(AnalysisError::invalid("date", "bucket segments at full granularity"));
            }
            (_, None) => {
                return Err(AnalysisError::invalid("date", format!("a {granularity} label is required")));
            }
            (_, Some(label)) => {
                label_range(label, granularity)?;
            }
        }
        let toggled = self.store.toggle_nominal(ts_id, channel, granularity, date)?;
        self.store.cache().invalidate(&bucket.id);
        Ok(toggled)
    }

    pub fn list_nominals(&self, ts_id: &str, channel: Option<&str>) -> Result<Vec<Nominal>> {
        self.store.list_nominals(ts_id, channel)
    }
}

fn check_weight(weight: Option<f64>) -> Result<()> {
    match weight.filter(|w| !w.is_finite() || *w < 0.0) {
        Some(w) => Err(AnalysisError::invalid("weight", format!("{w} is not a non-negative number"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AnalysisCache;
    use crate::store::tests::{minute_points, start_time};
    use chrono::Duration;

    fn service_with(registry: DetectorRegistry) -> AnalysisService {
        let store = Arc::new(Store::in_memory(Arc::new(AnalysisCache::new())).unwrap());
        AnalysisService::new(store, JobQueue::new(), Arc::new(registry), &ScoutConfig::default())
    }

    fn service() -> AnalysisService {
        service_with(DetectorRegistry::with_builtin())
    }

    fn request(bucket_type: &str, granularity: &str) -> CreateBucketRequest {
        CreateBucketRequest {
            name: "plant".into(),
            bucket_type: bucket_type.into(),
            classification_granularity: granularity.into(),
        }
    }

    #[test]
    fn test_create_bucket_uses_config_defaults() {
        let svc = service();
        let id = svc.create_bucket(&request("scoring", "hour")).unwrap();
        let bucket = svc.get_bucket(&id).unwrap();
        assert_eq!(bucket.threshold, 0.5);
        assert_eq!(bucket.smoothing_window, 11);
        assert_eq!(bucket.classification_granularity, Granularity::Full);
        let algos = svc.list_algorithms(&id).unwrap();
        assert_eq!(algos.len(), 1);
        assert_eq!(algos[0].algorithm, "EWMA");
    }

    #[test]
    fn test_invalid_granularity_is_configuration_error() {
        let svc = service();
        let err = svc.create_bucket(&request("classification", "week")).unwrap_err();
        assert!(err.is_configuration());
        assert!(svc.list_buckets().unwrap().is_empty());
    }

    #[test]
    fn test_unregistered_default_template_rejects_bucket() {
        let svc = service_with(DetectorRegistry::new());
        let err = svc.create_bucket(&request("scoring", "full")).unwrap_err();
        assert!(matches!(err, AnalysisError::UnknownAlgorithm(ref k) if k == "EWMA"));
    }

    #[test]
    fn test_add_algorithm_validates_key_and_type() {
        let svc = service();
        let id = svc.create_bucket(&request("scoring", "full")).unwrap();
        let params = Parameters::new();
        assert!(matches!(
            svc.add_algorithm(&id, "NOPE", "x", AnalysisType::Scoring, &params, None),
            Err(AnalysisError::UnknownAlgorithm(_))
        ));
        // registered, but as a classifier
        assert!(
            svc.add_algorithm(&id, "NEAREST_NORMAL", "x", AnalysisType::Scoring, &params, None)
                .is_err()
        );
        assert!(
            svc.add_algorithm(&id, "EWMA", "x", AnalysisType::Scoring, &params, Some(-1.0))
                .unwrap_err()
                .is_configuration()
        );
        svc.add_algorithm(&id, "EWMA", "fast", AnalysisType::Scoring, &params, Some(2.0))
            .unwrap();
        assert_eq!(svc.list_algorithms(&id).unwrap().len(), 2);
    }

    #[test]
    fn test_bookmark_search_and_resets_check_input() {
        let svc = service();
        let id = svc.create_bucket(&request("scoring", "full")).unwrap();
        let ts = svc.create_time_series(&id, "s", &["v".to_string()]).unwrap();
        svc.import_points(&ts, &minute_points("v", &[1.0, 2.0, 3.0])).unwrap();
        let manual = ManualAnomalyRequest {
            ts_id: ts,
            channel: "v".into(),
            start: start_time(),
            end: start_time() + Duration::minutes(2),
        };
        let aid = svc.add_manual_anomaly(&manual).unwrap().unwrap();

        assert!(svc.find_similar_bookmarks(&aid, None, None).unwrap().is_empty());
        assert!(
            svc.find_similar_bookmarks(&aid, Some(-1.0), None)
                .unwrap_err()
                .is_configuration()
        );
        assert!(svc.find_similar_bookmarks(&aid, None, Some(f64::NAN)).is_err());

        svc.get_anomaly(&aid).unwrap();
        assert_eq!(svc.reset_views(&id).unwrap(), 1);
        // hand-marked anomalies keep their rating
        assert_eq!(svc.reset_ratings(&id).unwrap(), 0);
        assert!(svc.reset_views("missing").is_err());

        let recs = svc.dissimilar_recommendations(&id, 3, false).unwrap();
        assert_eq!(recs.len(), 1);
        assert!(recs[0].suggestions.is_empty());
        assert_eq!(svc.estimate_ratings(&id, 3).unwrap().len(), 1);
    }

    #[test]
    fn test_update_algorithm_rejects_bad_weight() {
        let svc = service();
        let id = svc.create_bucket(&request("scoring", "full")).unwrap();
        let algo = svc.list_algorithms(&id).unwrap().remove(0);
        for weight in [-0.5, f64::NAN, f64::INFINITY] {
            let update = UpdateAlgorithmRequest {
                weight: Some(weight),
                ..Default::default()
            };
            assert!(svc.update_algorithm(&algo.id, &update).unwrap_err().is_configuration());
        }
        assert_eq!(svc.list_algorithms(&id).unwrap()[0].weight, algo.weight);

        let update = UpdateAlgorithmRequest {
            weight: Some(3.0),
            ..Default::default()
        };
        svc.update_algorithm(&algo.id, &update).unwrap();
        assert_eq!(svc.list_algorithms(&id).unwrap()[0].weight, Some(3.0));
    }

    #[test]
    fn test_enqueue_rejects_unknown_algorithm_before_queueing() {
        let svc = service();
        let id = svc.create_bucket(&request("scoring", "full")).unwrap();
        svc.store()
            .add_algorithm(&id, "GONE", "stale", AnalysisType::Scoring, &Parameters::new(), None)
            .unwrap();

        let err = svc.enqueue(&id).unwrap_err();
        assert!(err.is_configuration());
        assert!(svc.queued().unwrap().is_empty());
        assert!(!svc.queue.has_run(&id).unwrap());
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let svc = service();
        let id = svc.create_bucket(&request("scoring", "full")).unwrap();
        assert!(svc.enqueue(&id).unwrap());
        assert!(!svc.enqueue(&id).unwrap());
        assert_eq!(svc.queued().unwrap(), vec![id.clone()]);
        assert!(svc.enqueue("missing").is_err());
    }

    #[test]
    fn test_delete_bucket_leaves_queue() {
        let svc = service();
        let id = svc.create_bucket(&request("scoring", "full")).unwrap();
        svc.enqueue(&id).unwrap();
        assert!(svc.delete_bucket(&id).unwrap());
        assert!(svc.queued().unwrap().is_empty());
        assert_eq!(svc.status(&id).unwrap(), JobStatus::idle());
    }

    #[test]
    fn test_toggle_nominal_checks_label() {
        let svc = service();
        let id = svc.create_bucket(&request("classification", "day")).unwrap();
        let ts = svc.create_time_series(&id, "s", &["v".to_string()]).unwrap();
        svc.import_points(&ts, &minute_points("v", &[1.0, 2.0])).unwrap();

        assert!(svc.toggle_nominal(&ts, "v", None).unwrap_err().is_configuration());
        assert!(svc.toggle_nominal(&ts, "v", Some("2024-03-01T05")).is_err());
        assert_eq!(svc.toggle_nominal(&ts, "v", Some("2024-03-01")).unwrap(), NominalToggle::Added);
        assert_eq!(svc.list_nominals(&ts, Some("v")).unwrap().len(), 1);
        assert_eq!(svc.toggle_nominal(&ts, "v", Some("2024-03-01")).unwrap(), NominalToggle::Removed);
    }

    #[test]
    fn test_manual_anomaly_requires_known_channel() {
        let svc = service();
        let id = svc.create_bucket(&request("scoring", "full")).unwrap();
        let ts = svc.create_time_series(&id, "s", &["v".to_string()]).unwrap();
        let points = minute_points("v", &[1.0, 2.0, 3.0]);
        svc.import_points(&ts, &points).unwrap();

        let mut req = ManualAnomalyRequest {
            ts_id: ts.clone(),
            channel: "w".into(),
            start: points[0].timestamp,
            end: points[2].timestamp,
        };
        assert!(svc.add_manual_anomaly(&req).unwrap_err().is_configuration());

        req.channel = "v".into();
        let anomaly_id = svc.add_manual_anomaly(&req).unwrap().unwrap();
        let listed = svc.list_anomalies(&AnomalyFilter::series(&ts)).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].anomaly.id, anomaly_id);

        assert_eq!(svc.get_anomaly(&anomaly_id).unwrap().views, 0);
        assert_eq!(svc.get_anomaly(&anomaly_id).unwrap().views, 1);
        // manual anomalies are kept
        assert_eq!(svc.clear_anomalies(&ts).unwrap(), 0);
    }
}
