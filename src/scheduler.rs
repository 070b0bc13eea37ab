use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::detector::{DetectorRegistry, SegmentSet};
use crate::error::{AnalysisError, Result};
use crate::models::{
    Algorithm, AnalysisType, AnomalyClassification, AnomalyScore, Bucket, JobStatus, SegmentClass,
    TimeSeries, TimeWindow,
};
use crate::queue::JobQueue;
use crate::segments::{bucket_segments, segment_distances};
use crate::signal::resample;
use crate::store::Store;

/// Single consumer of the calculation queue. Runs one bucket at a time and
/// publishes progress into the queue's status store.
pub struct CalculationScheduler {
    store: Arc<Store>,
    queue: JobQueue,
    registry: Arc<DetectorRegistry>,
    poll_interval: Duration,
}

fn detector_error(algorithm: &Algorithm, err: anyhow::Error) -> AnalysisError {
    AnalysisError::Detector {
        algorithm: algorithm.name.clone(),
        message: format!("{err:#}"),
    }
}

impl CalculationScheduler {
    pub fn new(
        store: Arc<Store>,
        queue: JobQueue,
        registry: Arc<DetectorRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            poll_interval,
        }
    }

    /// Purges queue and status state, then spawns the worker loop. The loop
    /// exits once `cancel` fires; a job already running finishes first.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        if let Err(e) = self.queue.clear() {
            tracing::warn!("scheduler: failed to clear queue at start: {e}");
        }
        tracing::info!(
            "scheduler: started (poll interval {}ms)",
            self.poll_interval.as_millis()
        );
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let next = match self.queue.take_next() {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!("scheduler: failed to read queue: {e}");
                        None
                    }
                };
                let Some(bucket_id) = next else {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                };
                self.clone().run_job(bucket_id).await;
            }
            tracing::info!("scheduler: stopped");
        })
    }

    async fn run_job(self: Arc<Self>, bucket_id: String) {
        let span = tracing::info_span!(
            "calculation_job",
            bucket_id = %bucket_id,
            bucket_type = tracing::field::Empty
        );
        let scheduler = self.clone();
        let id = bucket_id.clone();
        let outcome =
            tokio::task::spawn_blocking(move || span.in_scope(|| scheduler.process_bucket(&id))).await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(join) => Some(format!("job aborted: {join}")),
        };
        if let Some(message) = failure {
            tracing::error!(bucket_id = %bucket_id, "scheduler: job failed: {message}");
            if let Err(e) = self.queue.record_failure(&bucket_id, &message) {
                tracing::error!("scheduler: failed to record failure for {bucket_id}: {e}");
            }
        }
        if let Err(e) = self.queue.finish_executing() {
            tracing::error!("scheduler: failed to release {bucket_id}: {e}");
        }
    }

    /// Runs the pipeline matching the bucket's type.
    pub fn process_bucket(&self, bucket_id: &str) -> Result<()> {
        let bucket = self.store.get_bucket(bucket_id)?;
        tracing::Span::current().record("bucket_type", bucket.bucket_type.as_str());
        tracing::info!("scheduler: processing bucket '{}'", bucket.name);
        match bucket.bucket_type {
            AnalysisType::Scoring => self.run_scoring(&bucket),
            AnalysisType::Classification => self.run_classification(&bucket),
        }
    }

    fn algorithms_of(&self, bucket: &Bucket, kind: AnalysisType) -> Result<Vec<Algorithm>> {
        Ok(self
            .store
            .list_algorithms(&bucket.id)?
            .into_iter()
            .filter(|a| a.algorithm_type == kind)
            .collect())
    }

    fn run_scoring(&self, bucket: &Bucket) -> Result<()> {
        let algorithms = self.algorithms_of(bucket, AnalysisType::Scoring)?;
        let series = self.store.list_time_series(&bucket.id)?;
        let total = algorithms.len() * series.len();
        self.queue.set_status(&bucket.id, JobStatus::preparing(total))?;

        let mut current = 0;
        for algorithm in &algorithms {
            let detector = self.registry.scorer(&algorithm.algorithm)?;
            for ts in &series {
                let scores = self.score_series(ts, algorithm, |values| {
                    detector
                        .score(&algorithm.parameters, values)
                        .map_err(|e| detector_error(algorithm, e))
                })?;
                self.store.replace_scores(&ts.id, &algorithm.id, &scores)?;
                current += 1;
                tracing::info!(
                    "scheduler: scored '{}' with '{}' ({current}/{total})",
                    ts.name,
                    algorithm.name
                );
                self.queue.set_status(
                    &bucket.id,
                    JobStatus::progress(format!("{} / {}", algorithm.name, ts.name), current, total),
                )?;
            }
        }
        self.queue.set_status(&bucket.id, JobStatus::done(total))?;
        Ok(())
    }

    /// Scores every channel of `ts`, resampling each detector output onto
    /// the channel's timestamps.
    fn score_series(
        &self,
        ts: &TimeSeries,
        algorithm: &Algorithm,
        score: impl Fn(&[f64]) -> Result<Vec<f64>>,
    ) -> Result<Vec<AnomalyScore>> {
        let mut out = Vec::new();
        for channel in &ts.channels {
            let points = self.store.channel_points(&ts.id, channel, &TimeWindow::default())?;
            if points.is_empty() {
                continue;
            }
            let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
            let raw = score(&values)?;
            if raw.is_empty() {
                return Err(AnalysisError::Detector {
                    algorithm: algorithm.name.clone(),
                    message: format!("no scores for {} points of channel '{channel}'", values.len()),
                });
            }
            let aligned = resample(&raw, values.len());
            out.extend(points.iter().zip(aligned).map(|((timestamp, _), value)| AnomalyScore {
                timestamp: *timestamp,
                channel: channel.clone(),
                value,
            }));
        }
        Ok(out)
    }

    fn run_classification(&self, bucket: &Bucket) -> Result<()> {
        let algorithms = self.algorithms_of(bucket, AnalysisType::Classification)?;
        let channels = self.store.bucket_channels(&bucket.id)?;
        let ts_ids: Vec<String> = self
            .store
            .list_time_series(&bucket.id)?
            .into_iter()
            .map(|ts| ts.id)
            .collect();
        let total = algorithms.len() * channels.len();
        self.queue.set_status(&bucket.id, JobStatus::preparing(total))?;
        if total == 0 {
            self.queue.set_status(&bucket.id, JobStatus::done(0))?;
            return Ok(());
        }

        let mut current = 0;
        for channel in &channels {
            let segments = bucket_segments(&self.store, bucket, channel)?;
            let distances = segment_distances(&self.store, &bucket.id, channel, &segments)?;
            let set = SegmentSet { segments, distances };

            for algorithm in &algorithms {
                let classifier = self.registry.classifier(&algorithm.algorithm)?;
                let labels = classifier
                    .classify(&algorithm.parameters, &set)
                    .map_err(|e| detector_error(algorithm, e))?;
                if labels.len() != set.len() {
                    return Err(AnalysisError::Detector {
                        algorithm: algorithm.name.clone(),
                        message: format!("{} labels for {} segments", labels.len(), set.len()),
                    });
                }
                let positives: Vec<AnomalyClassification> = set
                    .segments
                    .iter()
                    .zip(&labels)
                    .filter(|(_, label)| **label == SegmentClass::Abnormal)
                    .map(|(segment, _)| AnomalyClassification {
                        ts_id: segment.ts_id.clone(),
                        algorithm_id: algorithm.id.clone(),
                        channel: channel.clone(),
                        date_trunc: segment.label.clone(),
                        granularity: bucket.classification_granularity,
                    })
                    .collect();
                self.store
                    .replace_classifications(&algorithm.id, channel, &ts_ids, &positives)?;
                current += 1;
                tracing::info!(
                    "scheduler: classified channel '{channel}' with '{}' ({} of {} segments abnormal, {current}/{total})",
                    algorithm.name,
                    positives.len(),
                    set.len()
                );
                self.queue.set_status(
                    &bucket.id,
                    JobStatus::progress(format!("{} / {channel}", algorithm.name), current, total),
                )?;
            }
        }
        self.queue.set_status(&bucket.id, JobStatus::done(total))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AnalysisCache;
    use crate::detector::tests::{FailingScorer, FakeScorer};
    use crate::detector::{ScoringDetector, SegmentClassifier};
    use crate::models::{Granularity, Parameters};
    use crate::store::tests::{minute_points, start_time};
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        store: Arc<Store>,
        queue: JobQueue,
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Arc::new(Store::in_memory(Arc::new(AnalysisCache::new())).unwrap()),
            queue: JobQueue::new(),
        }
    }

    fn scheduler(f: &Fixture, registry: DetectorRegistry) -> Arc<CalculationScheduler> {
        Arc::new(CalculationScheduler::new(
            f.store.clone(),
            f.queue.clone(),
            Arc::new(registry),
            Duration::from_millis(10),
        ))
    }

    fn scoring_bucket_with(f: &Fixture, key: &str, series: usize, points: usize) -> String {
        let bucket = f
            .store
            .create_bucket("b", AnalysisType::Scoring, Granularity::Full, 0.5, 11, &[])
            .unwrap();
        f.store
            .add_algorithm(&bucket, key, key, AnalysisType::Scoring, &Parameters::new(), Some(1.0))
            .unwrap();
        let values: Vec<f64> = (0..points).map(|i| i as f64).collect();
        for i in 0..series {
            let ts = f
                .store
                .create_time_series(&bucket, &format!("s{i}"), &["v".to_string()])
                .unwrap();
            f.store.append_points(&ts, &minute_points("v", &values)).unwrap();
        }
        bucket
    }

    async fn wait_for(queue: &JobQueue, bucket: &str, done: impl Fn(&JobStatus) -> bool) -> JobStatus {
        for _ in 0..500 {
            let status = queue.status(bucket).unwrap();
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("bucket {bucket} never reached the expected status");
    }

    #[tokio::test]
    async fn test_scoring_job_end_to_end() {
        let f = fixture();
        let fake = Arc::new(FakeScorer::new(0.3));
        let mut registry = DetectorRegistry::new();
        registry.register_scorer("FAKE", fake.clone());
        let bucket = scoring_bucket_with(&f, "FAKE", 1, 10);

        let cancel = CancellationToken::new();
        let handle = scheduler(&f, registry).start(cancel.clone());
        assert!(f.queue.enqueue(&bucket).unwrap());

        let status = wait_for(&f.queue, &bucket, JobStatus::is_done).await;
        assert_eq!((status.current, status.total), (1, 1));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);

        let ts = f.store.list_time_series(&bucket).unwrap().remove(0);
        let algo = f.store.list_algorithms(&bucket).unwrap().remove(0);
        assert_eq!(f.store.count_scores(&ts.id, &algo.id).unwrap(), 10);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_job_does_not_stop_queue() {
        let f = fixture();
        let mut registry = DetectorRegistry::new();
        registry.register_scorer("FAIL", Arc::new(FailingScorer));
        registry.register_scorer("FAKE", Arc::new(FakeScorer::new(0.1)));
        let broken = scoring_bucket_with(&f, "FAIL", 1, 10);
        let healthy = scoring_bucket_with(&f, "FAKE", 2, 10);

        let cancel = CancellationToken::new();
        let handle = scheduler(&f, registry).start(cancel.clone());
        f.queue.enqueue(&broken).unwrap();
        f.queue.enqueue(&healthy).unwrap();

        let status = wait_for(&f.queue, &healthy, JobStatus::is_done).await;
        assert_eq!(status.total, 2);

        let failed = f.queue.status(&broken).unwrap();
        assert!(failed.is_error());
        let message = failed.error.unwrap();
        assert!(message.contains("model not fitted"), "{message}");
        assert!(f.queue.errored(&broken).unwrap().is_some());

        // re-enqueue after a failure is allowed
        assert!(f.queue.enqueue(&broken).unwrap());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_clears_previous_state() {
        let f = fixture();
        f.queue.enqueue("stale").unwrap();
        f.queue.set_status("old", JobStatus::done(3)).unwrap();

        let cancel = CancellationToken::new();
        let handle = scheduler(&f, DetectorRegistry::new()).start(cancel.clone());
        assert!(f.queue.is_empty().unwrap());
        assert!(!f.queue.has_run("old").unwrap());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_bucket_is_recorded_as_error() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let handle = scheduler(&f, DetectorRegistry::new()).start(cancel.clone());
        f.queue.enqueue("missing").unwrap();
        let status = wait_for(&f.queue, "missing", JobStatus::is_error).await;
        assert!(status.error.unwrap().contains("not found"));
        cancel.cancel();
        handle.await.unwrap();
    }

    /// Records the published `current` each time it is invoked, and whether
    /// its bucket was queued again while running.
    struct ProgressRecorder {
        queue: JobQueue,
        bucket: Mutex<String>,
        seen: Mutex<Vec<usize>>,
        requeued: AtomicUsize,
    }

    impl ProgressRecorder {
        fn new(queue: &JobQueue) -> Arc<Self> {
            Arc::new(Self {
                queue: queue.clone(),
                bucket: Mutex::new(String::new()),
                seen: Mutex::new(Vec::new()),
                requeued: AtomicUsize::new(0),
            })
        }
    }

    impl ScoringDetector for ProgressRecorder {
        fn score(&self, _: &Parameters, values: &[f64]) -> anyhow::Result<Vec<f64>> {
            let bucket = self.bucket.lock().unwrap().clone();
            let status = self.queue.status(&bucket)?;
            self.seen.lock().unwrap().push(status.current);
            if self.queue.list()?.contains(&bucket) {
                self.requeued.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(2));
            // half as many scores as values; the pipeline resamples
            Ok(vec![1.0; values.len().div_ceil(2)])
        }
    }

    #[test]
    fn test_progress_is_monotonic() {
        let f = fixture();
        let recorder = ProgressRecorder::new(&f.queue);
        let mut registry = DetectorRegistry::new();
        registry.register_scorer("RECORD", recorder.clone());
        let bucket = scoring_bucket_with(&f, "RECORD", 2, 8);
        f.store
            .add_algorithm(&bucket, "RECORD", "second", AnalysisType::Scoring, &Parameters::new(), None)
            .unwrap();
        *recorder.bucket.lock().unwrap() = bucket.clone();

        scheduler(&f, registry).process_bucket(&bucket).unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1, 2, 3]);
        let status = f.queue.status(&bucket).unwrap();
        assert!(status.is_done());
        assert_eq!((status.current, status.total), (4, 4));

        let ts = f.store.list_time_series(&bucket).unwrap().remove(0);
        for algo in f.store.list_algorithms(&bucket).unwrap() {
            assert_eq!(f.store.count_scores(&ts.id, &algo.id).unwrap(), 8);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueue_runs_bucket_exclusively() {
        let f = fixture();
        let recorder = ProgressRecorder::new(&f.queue);
        let mut registry = DetectorRegistry::new();
        registry.register_scorer("RECORD", recorder.clone());
        let bucket = scoring_bucket_with(&f, "RECORD", 3, 8);
        *recorder.bucket.lock().unwrap() = bucket.clone();

        let cancel = CancellationToken::new();
        let handle = scheduler(&f, registry).start(cancel.clone());
        let producers: Vec<_> = (0..8)
            .map(|_| {
                let queue = f.queue.clone();
                let bucket = bucket.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        queue.enqueue(&bucket).unwrap();
                        let entries = queue.list().unwrap().iter().filter(|b| **b == bucket).count();
                        assert!(entries <= 1, "{entries} queue entries for one bucket");
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        for _ in 0..500 {
            if f.queue.is_empty().unwrap() && f.queue.executing().unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = f.queue.status(&bucket).unwrap();
        assert!(status.is_done());
        assert_eq!((status.current, status.total), (3, 3));

        // runs never interleave and progress only moves forward within one
        let seen = recorder.seen.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert_eq!(seen.len() % 3, 0);
        assert!(seen.chunks(3).all(|run| run == [0, 1, 2]));
        assert_eq!(recorder.requeued.load(Ordering::SeqCst), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    struct AllAbnormal;

    impl SegmentClassifier for AllAbnormal {
        fn classify(&self, _: &Parameters, set: &SegmentSet) -> anyhow::Result<Vec<SegmentClass>> {
            Ok(vec![SegmentClass::Abnormal; set.len()])
        }
    }

    #[test]
    fn test_classification_pipeline_replaces_labels() {
        let f = fixture();
        let mut registry = DetectorRegistry::new();
        registry.register_classifier("ALL", Arc::new(AllAbnormal));
        let bucket = f
            .store
            .create_bucket("c", AnalysisType::Classification, Granularity::Hour, 0.5, 11, &[])
            .unwrap();
        let algo = f
            .store
            .add_algorithm(&bucket, "ALL", "all", AnalysisType::Classification, &Parameters::new(), None)
            .unwrap();
        let ts = f.store.create_time_series(&bucket, "s", &["v".to_string()]).unwrap();
        let points: Vec<_> = (0..24)
            .map(|i| crate::models::DataPoint {
                timestamp: start_time() + ChronoDuration::minutes(i * 5),
                values: BTreeMap::from([("v".to_string(), i as f64)]),
            })
            .collect();
        f.store.append_points(&ts, &points).unwrap();

        let scheduler = scheduler(&f, registry);
        scheduler.process_bucket(&bucket).unwrap();
        scheduler.process_bucket(&bucket).unwrap();

        let labels = f.store.classifications(&ts, "v").unwrap();
        assert_eq!(labels.len(), 2);
        assert!(labels.iter().all(|l| l.algorithm_id == algo));
        assert_eq!(labels[0].date_trunc.as_deref(), Some("2024-03-01T00"));
        assert_eq!(labels[1].date_trunc.as_deref(), Some("2024-03-01T01"));
        let status = f.queue.status(&bucket).unwrap();
        assert_eq!((status.current, status.total), (1, 1));
    }
}
