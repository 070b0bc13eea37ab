//! Per-series ensemble query and the aggregate views over series lists.
//!
//! A query fetches one channel's raw values and every contributing
//! algorithm's scores, brings them to a common length, normalizes the scores
//! against bucket-wide baselines and averages them into one ensemble score.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::models::{Algorithm, AnalysisType, Baseline, Bucket, TimeSeries, TimeWindow};
use crate::segments::series_segments;
use crate::signal::{dba, downsample, downsample_labels, resample, savgol_filter};
use crate::store::Store;

/// Polynomial degree of the post-processing filter.
const SMOOTHING_ORDER: usize = 3;
/// Length series are brought to before barycenter averaging.
const BARYCENTER_LENGTH: usize = 100;
/// Series shorter than this are left out of list queries.
const MIN_LIST_POINTS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct SeriesQuery {
    pub ts_id: String,
    pub channel: String,
    pub window: TimeWindow,
    /// Target point count. `None` keeps the native resolution.
    pub n_segments: Option<usize>,
    /// Skip scoring and return raw values only.
    pub only_ts: bool,
}

impl SeriesQuery {
    pub fn new(ts_id: &str, channel: &str) -> Self {
        Self {
            ts_id: ts_id.to_string(),
            channel: channel.to_string(),
            ..Default::default()
        }
    }

    pub fn segments(mut self, n: usize) -> Self {
        self.n_segments = Some(n);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Normalized score per algorithm id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensemble: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensemble_processed: Option<f64>,
}

/// An algorithm that contributes to a series channel's ensemble.
struct Contributor {
    algorithm: Algorithm,
    baseline: Baseline,
}

/// Scoring algorithms of the bucket that have scores for this series channel
/// and a baseline, in the bucket's algorithm order.
fn contributors(store: &Store, bucket: &Bucket, ts_id: &str, channel: &str) -> Result<Vec<Contributor>> {
    let scored = store.scored_algorithms(ts_id, channel)?;
    if scored.is_empty() {
        return Ok(Vec::new());
    }
    let mut baselines = store.baselines(&bucket.id, channel)?;
    Ok(store
        .list_algorithms(&bucket.id)?
        .into_iter()
        .filter(|a| a.algorithm_type == AnalysisType::Scoring && scored.contains(&a.id))
        .filter_map(|algorithm| {
            let baseline = baselines.remove(&algorithm.id)?;
            Some(Contributor { algorithm, baseline })
        })
        .collect())
}

/// Brings one algorithm's stored scores onto the point grid of the query.
fn aligned_scores(
    store: &Store,
    query: &SeriesQuery,
    algorithm_id: &str,
    native_len: usize,
) -> Result<Vec<f64>> {
    let raw: Vec<f64> = store
        .scores(&query.ts_id, algorithm_id, &query.channel, &query.window)?
        .into_iter()
        .map(|s| s.value)
        .collect();
    let native = if raw.len() != native_len {
        resample(&raw, native_len)
    } else {
        raw
    };
    Ok(downsample(&native, query.n_segments))
}

pub fn normalize(values: &[f64], baseline: &Baseline) -> Vec<f64> {
    values.iter().map(|v| baseline.normalize(*v)).collect()
}

/// Weighted mean across rows at each position. Missing weights count as
/// zero; when no weight is positive the mean is unweighted.
pub fn weighted_ensemble(rows: &[Vec<f64>], weights: &[Option<f64>]) -> Vec<f64> {
    let len = rows.iter().map(Vec::len).min().unwrap_or(0);
    let weights: Vec<f64> = weights.iter().map(|w| w.unwrap_or(0.0).max(0.0)).collect();
    let total: f64 = weights.iter().sum();
    let (weights, total) = if total > 0.0 {
        (weights, total)
    } else {
        (vec![1.0; rows.len()], rows.len() as f64)
    };
    (0..len)
        .map(|i| rows.iter().zip(&weights).map(|(r, w)| r[i] * w).sum::<f64>() / total)
        .collect()
}

/// Smooths the ensemble when `5 < window < n - 2` (or `window > 5` with no
/// target count). Any smoothing failure returns the input unchanged.
pub fn post_process(ensemble: &[f64], window: usize, n_segments: Option<usize>) -> Vec<f64> {
    let applies = match n_segments {
        None => window > 5,
        Some(n) => window > 5 && n > 2 && window < n - 2,
    };
    if !applies {
        return ensemble.to_vec();
    }
    match savgol_filter(ensemble, window, SMOOTHING_ORDER) {
        Ok(smoothed) => smoothed,
        Err(e) => {
            tracing::debug!("ensemble: smoothing skipped: {e}");
            ensemble.to_vec()
        }
    }
}

/// Raw values plus normalized scores, ensemble and smoothed ensemble for
/// one series channel.
pub fn query_series(store: &Store, query: &SeriesQuery) -> Result<Vec<QueryPoint>> {
    let ts = store.get_time_series(&query.ts_id)?;
    let bucket = store.get_bucket(&ts.bucket_id)?;

    let points = store.channel_points(&ts.id, &query.channel, &query.window)?;
    let native_len = points.len();
    let timestamps: Vec<DateTime<Utc>> = points.iter().map(|(t, _)| *t).collect();
    let raw: Vec<f64> = points.into_iter().map(|(_, v)| v).collect();
    let values = downsample(&raw, query.n_segments);
    let timestamps = downsample_labels(&timestamps, query.n_segments);

    let contributors = if query.only_ts {
        Vec::new()
    } else {
        contributors(store, &bucket, &ts.id, &query.channel)?
    };
    if contributors.is_empty() {
        return Ok(timestamps
            .into_iter()
            .zip(values)
            .map(|(timestamp, value)| QueryPoint {
                timestamp,
                value,
                scores: None,
                ensemble: None,
                ensemble_processed: None,
            })
            .collect());
    }

    let mut normalized = Vec::with_capacity(contributors.len());
    for c in &contributors {
        let scores = aligned_scores(store, query, &c.algorithm.id, native_len)?;
        normalized.push(normalize(&scores, &c.baseline));
    }
    let weights: Vec<Option<f64>> = contributors.iter().map(|c| c.algorithm.weight).collect();
    let ensemble = weighted_ensemble(&normalized, &weights);
    let processed = post_process(&ensemble, bucket.smoothing_window, query.n_segments);

    Ok(timestamps
        .into_iter()
        .zip(values)
        .enumerate()
        .map(|(i, (timestamp, value))| QueryPoint {
            timestamp,
            value,
            scores: Some(
                contributors
                    .iter()
                    .zip(&normalized)
                    .filter_map(|(c, row)| Some((c.algorithm.id.clone(), *row.get(i)?)))
                    .collect(),
            ),
            ensemble: ensemble.get(i).copied(),
            ensemble_processed: processed.get(i).copied(),
        })
        .collect())
}

// ── Aggregates over series lists ──

#[derive(Debug, Clone, Serialize)]
pub struct SeriesSummary {
    pub values: Vec<f64>,
    /// Fraction of processed ensemble points above the bucket threshold.
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesListView {
    pub series: BTreeMap<String, SeriesSummary>,
    pub barycenter: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlgorithmRatio {
    pub algorithm_id: String,
    pub ratio: f64,
}

fn series_of(store: &Store, ts_ids: &[String]) -> Result<Vec<TimeSeries>> {
    ts_ids.iter().map(|id| store.get_time_series(id)).collect()
}

/// Values of every listed series at a common length, each with its ensemble
/// ratio, plus their DTW barycenter.
///
/// The length is `n_segments` capped at the mean native length. Series with
/// fewer than three points are left out.
pub fn query_series_list(
    store: &Store,
    ts_ids: &[String],
    channel: &str,
    n_segments: Option<usize>,
) -> Result<SeriesListView> {
    let mut view = SeriesListView {
        series: BTreeMap::new(),
        barycenter: Vec::new(),
    };
    if ts_ids.is_empty() {
        return Ok(view);
    }
    let series = series_of(store, ts_ids)?;
    let mut thresholds: HashMap<String, f64> = HashMap::new();
    let mut raw: Vec<(String, Vec<f64>, f64)> = Vec::with_capacity(series.len());
    for ts in &series {
        if !thresholds.contains_key(&ts.bucket_id) {
            thresholds.insert(ts.bucket_id.clone(), store.get_bucket(&ts.bucket_id)?.threshold);
        }
        let values: Vec<f64> = store
            .channel_points(&ts.id, channel, &TimeWindow::default())?
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        raw.push((ts.id.clone(), values, thresholds[&ts.bucket_id]));
    }
    raw.sort_by(|a, b| a.0.cmp(&b.0));

    let total_len: usize = raw.iter().map(|(_, v, _)| v.len()).sum();
    let avg_len = total_len.div_ceil(raw.len());
    let target = n_segments.map_or(avg_len, |n| n.min(avg_len));

    let mut reduced = Vec::new();
    let mut first = None;
    for (id, values, threshold) in raw {
        if values.len() < MIN_LIST_POINTS {
            continue;
        }
        let resampled = resample(&values, target);
        reduced.push(resample(&values, BARYCENTER_LENGTH));
        first.get_or_insert_with(|| resampled.clone());

        let mut query = SeriesQuery::new(&id, channel);
        query.n_segments = Some(target);
        let ratio = ensemble_ratio(&query_series(store, &query)?, threshold);
        view.series.insert(id, SeriesSummary { values: resampled, ratio });
    }

    view.barycenter = match (ts_ids.len(), first) {
        (_, None) => Vec::new(),
        (1, Some(only)) => only,
        (_, Some(_)) => resample(&dba(&reduced), target),
    };
    Ok(view)
}

fn ensemble_ratio(points: &[QueryPoint], threshold: f64) -> f64 {
    let processed: Vec<f64> = points.iter().filter_map(|p| p.ensemble_processed).collect();
    if processed.is_empty() {
        return 0.0;
    }
    processed.iter().filter(|v| **v > threshold).count() as f64 / processed.len() as f64
}

/// Normalized score rows of the listed series per scoring algorithm, one row
/// per series the algorithm scored. Rows are resampled when `target` is set.
fn normalized_score_rows(
    store: &Store,
    bucket: &Bucket,
    ts_ids: &[String],
    channel: &str,
    target: Option<usize>,
) -> Result<BTreeMap<String, Vec<Vec<f64>>>> {
    let baselines = store.baselines(&bucket.id, channel)?;
    let mut rows: BTreeMap<String, Vec<Vec<f64>>> = BTreeMap::new();
    for ts_id in ts_ids {
        for algorithm_id in store.scored_algorithms(ts_id, channel)? {
            let Some(baseline) = baselines.get(&algorithm_id) else {
                continue;
            };
            let raw: Vec<f64> = store
                .scores(ts_id, &algorithm_id, channel, &TimeWindow::default())?
                .into_iter()
                .map(|s| s.value)
                .collect();
            let values = match target {
                Some(n) => resample(&raw, n),
                None => raw,
            };
            rows.entry(algorithm_id).or_default().push(normalize(&values, baseline));
        }
    }
    Ok(rows)
}

fn first_bucket(store: &Store, ts_ids: &[String]) -> Result<Option<Bucket>> {
    let Some(first) = ts_ids.first() else {
        return Ok(None);
    };
    Ok(Some(store.get_bucket(&store.get_time_series(first)?.bucket_id)?))
}

/// Per scoring algorithm, the fraction of listed series whose normalized
/// scores (resampled to `n_segments`) exceed the bucket threshold anywhere.
pub fn algorithm_score_ratios(
    store: &Store,
    ts_ids: &[String],
    channel: &str,
    n_segments: Option<usize>,
) -> Result<Vec<AlgorithmRatio>> {
    let Some(bucket) = first_bucket(store, ts_ids)? else {
        return Ok(Vec::new());
    };
    let target = n_segments.filter(|n| *n > 2);
    Ok(normalized_score_rows(store, &bucket, ts_ids, channel, target)?
        .into_iter()
        .map(|(algorithm_id, rows)| {
            let above = rows
                .iter()
                .filter(|row| row.iter().any(|v| *v > bucket.threshold))
                .count();
            AlgorithmRatio {
                algorithm_id,
                ratio: above as f64 / ts_ids.len() as f64,
            }
        })
        .collect())
}

/// Per-point maximum over scoring algorithms of each algorithm's mean
/// normalized score across the listed series, every row resampled to
/// `n_segments`. Empty when nothing is scored.
pub fn max_score_curve(store: &Store, ts_ids: &[String], channel: &str, n_segments: usize) -> Result<Vec<f64>> {
    let Some(bucket) = first_bucket(store, ts_ids)? else {
        return Ok(Vec::new());
    };
    let rows = normalized_score_rows(store, &bucket, ts_ids, channel, Some(n_segments))?;
    let curve = rows
        .values()
        .map(|series| weighted_ensemble(series, &vec![None; series.len()]))
        .reduce(|acc, mean| acc.iter().zip(&mean).map(|(a, b)| a.max(*b)).collect());
    Ok(curve.unwrap_or_default())
}

/// Per classification algorithm, the fraction of all segments of the listed
/// series it labelled positive.
pub fn classification_ratios(store: &Store, ts_ids: &[String], channel: &str) -> Result<Vec<AlgorithmRatio>> {
    let Some(bucket) = first_bucket(store, ts_ids)? else {
        return Ok(Vec::new());
    };
    let granularity = bucket.classification_granularity;
    let mut total_segments = 0usize;
    let mut counts: HashMap<String, usize> = HashMap::new();

    for ts_id in ts_ids {
        total_segments += series_segments(store, ts_id, channel, granularity)?.len();
        for c in store.classifications(ts_id, channel)? {
            *counts.entry(c.algorithm_id).or_default() += 1;
        }
    }
    if total_segments == 0 {
        return Ok(Vec::new());
    }
    let mut ratios: Vec<AlgorithmRatio> = counts
        .into_iter()
        .map(|(algorithm_id, count)| AlgorithmRatio {
            algorithm_id,
            ratio: count as f64 / total_segments as f64,
        })
        .collect();
    ratios.sort_by(|a, b| a.algorithm_id.cmp(&b.algorithm_id));
    Ok(ratios)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnomalyClassification, AnomalyScore, Granularity, Parameters};
    use crate::store::tests::{minute_points, scoring_bucket, start_time, test_store};
    use chrono::Duration;

    fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
        assert!(
            (actual - expected).abs() < epsilon,
            "expected {expected}, got {actual}"
        );
    }

    fn store_scores(store: &Store, ts: &str, algo: &str, values: &[f64]) {
        let scores: Vec<AnomalyScore> = values
            .iter()
            .enumerate()
            .map(|(i, v)| AnomalyScore {
                timestamp: start_time() + Duration::minutes(i as i64),
                channel: "v".into(),
                value: *v,
            })
            .collect();
        store.replace_scores(ts, algo, &scores).unwrap();
    }

    fn add_scoring(store: &Store, bucket: &str, weight: Option<f64>) -> String {
        store
            .add_algorithm(bucket, "EWMA", "e", AnalysisType::Scoring, &Parameters::new(), weight)
            .unwrap()
    }

    #[test]
    fn test_weighted_ensemble() {
        let rows = vec![vec![0.2, 0.8], vec![0.6, 0.4]];
        let out = weighted_ensemble(&rows, &[Some(1.0), Some(3.0)]);
        assert_approx(out[0], 0.5, 1e-12);
        assert_approx(out[1], 0.5, 1e-12);
    }

    #[test]
    fn test_zero_weights_fall_back_to_mean() {
        let rows = vec![vec![0.0, 1.0], vec![1.0, 1.0]];
        let out = weighted_ensemble(&rows, &[None, Some(0.0)]);
        assert_eq!(out, vec![0.5, 1.0]);
    }

    #[test]
    fn test_post_process_bounds() {
        let data: Vec<f64> = (0..30).map(|i| ((i * 7) % 5) as f64).collect();
        assert_eq!(post_process(&data, 5, None), data);
        assert_eq!(post_process(&data, 11, Some(12)), data);
        assert_ne!(post_process(&data, 11, None), data);
        assert_ne!(post_process(&data, 11, Some(30)), data);
        // even window fails inside the filter and passes through
        assert_eq!(post_process(&data, 10, None), data);
    }

    #[test]
    fn test_query_without_algorithms_returns_raw_values() {
        let store = test_store();
        let bucket = scoring_bucket(&store);
        let ts = store.create_time_series(&bucket, "s", &["v".to_string()]).unwrap();
        store.append_points(&ts, &minute_points("v", &[1.0, 2.0, 3.0])).unwrap();

        let out = query_series(&store, &SeriesQuery::new(&ts, "v")).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|p| p.scores.is_none() && p.ensemble.is_none()));
        let json = serde_json::to_value(&out[0]).unwrap();
        assert!(json.get("ensemble").is_none());
    }

    #[test]
    fn test_unscored_algorithm_is_excluded() {
        let store = test_store();
        let bucket = scoring_bucket(&store);
        let ts = store.create_time_series(&bucket, "s", &["v".to_string()]).unwrap();
        store.append_points(&ts, &minute_points("v", &[1.0, 2.0, 3.0])).unwrap();
        let scored = add_scoring(&store, &bucket, Some(1.0));
        add_scoring(&store, &bucket, Some(5.0));
        store_scores(&store, &ts, &scored, &[0.0, 5.0, 10.0]);

        let out = query_series(&store, &SeriesQuery::new(&ts, "v")).unwrap();
        let scores = out[1].scores.as_ref().unwrap();
        assert_eq!(scores.len(), 1);
        assert_approx(scores[&scored], 0.5, 1e-12);
        assert_approx(out[2].ensemble.unwrap(), 1.0, 1e-12);
    }

    #[test]
    fn test_degenerate_baseline_gives_zero_ensemble() {
        let store = test_store();
        let bucket = scoring_bucket(&store);
        let ts = store.create_time_series(&bucket, "s", &["v".to_string()]).unwrap();
        store.append_points(&ts, &minute_points("v", &[1.0, 2.0, 3.0])).unwrap();
        let algo = add_scoring(&store, &bucket, None);
        store_scores(&store, &ts, &algo, &[4.0, 4.0, 4.0]);

        let out = query_series(&store, &SeriesQuery::new(&ts, "v")).unwrap();
        for p in out {
            assert_eq!(p.ensemble, Some(0.0));
            assert_eq!(p.ensemble_processed, Some(0.0));
        }
    }

    #[test]
    fn test_downsampling_to_n_segments() {
        let store = test_store();
        let bucket = scoring_bucket(&store);
        let ts = store.create_time_series(&bucket, "s", &["v".to_string()]).unwrap();
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        store.append_points(&ts, &minute_points("v", &values)).unwrap();
        let algo = add_scoring(&store, &bucket, Some(1.0));
        store_scores(&store, &ts, &algo, &values);

        let out = query_series(&store, &SeriesQuery::new(&ts, "v").segments(10)).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(out[0].value, 0.0);
        assert_eq!(out[9].value, 99.0);
        assert_eq!(out[1].timestamp, start_time() + Duration::minutes(10));

        let full = query_series(&store, &SeriesQuery::new(&ts, "v").segments(500)).unwrap();
        assert_eq!(full.len(), 100);
    }

    #[test]
    fn test_window_limits_points_and_scores() {
        let store = test_store();
        let bucket = scoring_bucket(&store);
        let ts = store.create_time_series(&bucket, "s", &["v".to_string()]).unwrap();
        let values: Vec<f64> = (0..10).map(|i| i as f64).collect();
        store.append_points(&ts, &minute_points("v", &values)).unwrap();
        let algo = add_scoring(&store, &bucket, Some(1.0));
        let scores: Vec<f64> = values.iter().map(|v| v * 2.0).collect();
        store_scores(&store, &ts, &algo, &scores);

        let mut query = SeriesQuery::new(&ts, "v");
        query.window = TimeWindow::between(start_time() + Duration::minutes(3), start_time() + Duration::minutes(6));
        let out = query_series(&store, &query).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].timestamp, start_time() + Duration::minutes(3));
        assert_eq!(out[3].timestamp, start_time() + Duration::minutes(6));
        // baseline spans the whole bucket, 0..18
        for p in &out {
            assert_approx(p.scores.as_ref().unwrap()[&algo], p.value / 9.0, 1e-12);
            assert_approx(p.ensemble.unwrap(), p.value / 9.0, 1e-12);
        }
    }

    #[test]
    fn test_only_ts_skips_scores() {
        let store = test_store();
        let bucket = scoring_bucket(&store);
        let ts = store.create_time_series(&bucket, "s", &["v".to_string()]).unwrap();
        store.append_points(&ts, &minute_points("v", &[1.0, 2.0])).unwrap();
        let algo = add_scoring(&store, &bucket, Some(1.0));
        store_scores(&store, &ts, &algo, &[0.0, 1.0]);

        let mut query = SeriesQuery::new(&ts, "v");
        query.only_ts = true;
        let out = query_series(&store, &query).unwrap();
        assert!(out.iter().all(|p| p.scores.is_none()));
    }

    #[test]
    fn test_series_list_barycenter() {
        let store = test_store();
        let bucket = scoring_bucket(&store);
        let a = store.create_time_series(&bucket, "a", &["v".to_string()]).unwrap();
        let b = store.create_time_series(&bucket, "b", &["v".to_string()]).unwrap();
        let short = store.create_time_series(&bucket, "c", &["v".to_string()]).unwrap();
        store.append_points(&a, &minute_points("v", &[0.0; 20])).unwrap();
        store.append_points(&b, &minute_points("v", &[2.0; 20])).unwrap();
        store.append_points(&short, &minute_points("v", &[1.0, 1.0])).unwrap();

        let single = query_series_list(&store, &[a.clone()], "v", Some(10)).unwrap();
        assert_eq!(single.barycenter, vec![0.0; 10]);

        let view = query_series_list(&store, &[a.clone(), b.clone(), short.clone()], "v", Some(10)).unwrap();
        assert_eq!(view.series.len(), 2);
        assert!(!view.series.contains_key(&short));
        assert_eq!(view.series[&a].values.len(), 10);
        assert_eq!(view.series[&a].ratio, 0.0);
        assert_eq!(view.barycenter.len(), 10);
        for v in &view.barycenter {
            assert_approx(*v, 1.0, 1e-9);
        }
    }

    #[test]
    fn test_algorithm_score_ratios() {
        let store = test_store();
        let bucket = scoring_bucket(&store);
        let algo = add_scoring(&store, &bucket, Some(1.0));
        let a = store.create_time_series(&bucket, "a", &["v".to_string()]).unwrap();
        let b = store.create_time_series(&bucket, "b", &["v".to_string()]).unwrap();
        store_scores(&store, &a, &algo, &[0.0, 0.1, 0.2]);
        store_scores(&store, &b, &algo, &[0.0, 1.0, 0.0]);

        let ratios = algorithm_score_ratios(&store, &[a, b], "v", None).unwrap();
        assert_eq!(ratios, vec![AlgorithmRatio { algorithm_id: algo, ratio: 0.5 }]);
    }

    #[test]
    fn test_max_score_curve() {
        let store = test_store();
        let bucket = scoring_bucket(&store);
        let first = add_scoring(&store, &bucket, Some(1.0));
        let second = add_scoring(&store, &bucket, Some(1.0));
        let a = store.create_time_series(&bucket, "a", &["v".to_string()]).unwrap();
        let b = store.create_time_series(&bucket, "b", &["v".to_string()]).unwrap();
        store_scores(&store, &a, &first, &[0.0, 5.0, 10.0]);
        store_scores(&store, &b, &first, &[10.0, 5.0, 0.0]);
        store_scores(&store, &a, &second, &[4.0, 0.0, 4.0]);
        store_scores(&store, &b, &second, &[4.0, 0.0, 0.0]);

        // means are [0.5, 0.5, 0.5] and [1.0, 0.0, 0.5]
        let curve = max_score_curve(&store, &[a.clone(), b.clone()], "v", 3).unwrap();
        assert_eq!(curve.len(), 3);
        assert_approx(curve[0], 1.0, 1e-12);
        assert_approx(curve[1], 0.5, 1e-12);
        assert_approx(curve[2], 0.5, 1e-12);

        assert_eq!(max_score_curve(&store, &[a.clone()], "v", 5).unwrap().len(), 5);
        assert!(max_score_curve(&store, &[], "v", 3).unwrap().is_empty());
        assert!(max_score_curve(&store, &[a], "w", 3).unwrap().is_empty());
    }

    #[test]
    fn test_classification_ratios_full_granularity() {
        let store = test_store();
        let bucket = store
            .create_bucket("c", AnalysisType::Classification, Granularity::Full, 0.5, 11, &[])
            .unwrap();
        let algo = store
            .add_algorithm(&bucket, "NEAREST_NORMAL", "n", AnalysisType::Classification, &Parameters::new(), None)
            .unwrap();
        let ids: Vec<String> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| store.create_time_series(&bucket, n, &["v".to_string()]).unwrap())
            .collect();
        for id in &ids {
            // three days of points, still one segment
            let mut points = minute_points("v", &[1.0; 3]);
            for (i, p) in points.iter_mut().enumerate() {
                p.timestamp = start_time() + Duration::days(i as i64);
            }
            store.append_points(id, &points).unwrap();
        }
        let label = AnomalyClassification {
            ts_id: ids[0].clone(),
            algorithm_id: algo.clone(),
            channel: "v".into(),
            date_trunc: None,
            granularity: Granularity::Full,
        };
        store.replace_classifications(&algo, "v", &ids, &[label]).unwrap();

        let ratios = classification_ratios(&store, &ids, "v").unwrap();
        assert_eq!(ratios, vec![AlgorithmRatio { algorithm_id: algo, ratio: 0.25 }]);
    }
}
