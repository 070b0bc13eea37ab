//! Turns stored results into anomaly records.
//!
//! Scoring buckets yield one anomaly per run of processed ensemble values at
//! or above the bucket threshold. Classification buckets yield one anomaly
//! per segment that enough classifiers labelled positive. Candidates that a
//! kept anomaly already covers are dropped before insertion.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::ensemble::{SeriesQuery, query_series};
use crate::error::Result;
use crate::models::{
    AnalysisType, Anomaly, AnomalyFilter, Bucket, ClassificationEnsemble, NewAnomaly, TimeSeries,
};
use crate::segments::series_segments;
use crate::store::Store;

/// Shorter runs above threshold are not anomalies.
pub const MIN_RUN_LENGTH: usize = 5;
/// Candidates overlapping a kept anomaly at least this much are dropped.
pub const OVERLAP_LIMIT: f64 = 0.9;

/// Fraction of interval 2 covered by interval 1. Containment of interval 2
/// counts as full coverage; intervals touching at one end count as one
/// shared unit.
pub fn overlap(start1: i64, end1: i64, start2: i64, end2: i64) -> f64 {
    if start1 <= start2 && end1 >= end2 {
        return 1.0;
    }
    if end1 < start2 || end2 < start1 {
        return 0.0;
    }
    if end1 == start2 || start1 == end2 {
        return 1.0 / (end2 - start2 + 1) as f64;
    }
    let span = (end2 - start2).max(1) as f64;
    (end1.min(end2) - start1.max(start2)) as f64 / span
}

fn base(ts: &TimeSeries, channel: &str, start: DateTime<Utc>, end: DateTime<Utc>, length: usize, score: f64) -> NewAnomaly {
    NewAnomaly {
        ts_id: ts.id.clone(),
        bucket_id: ts.bucket_id.clone(),
        channel: channel.to_string(),
        start,
        end,
        length: length as i64,
        score,
    }
}

/// Runs of `value >= threshold` at least [`MIN_RUN_LENGTH`] long, as
/// `(first index, last index, mean value)`.
pub fn runs_above(values: &[f64], threshold: f64) -> Vec<(usize, usize, f64)> {
    let mut runs = Vec::new();
    let mut start = None;
    let mut sum = 0.0;
    for (i, &v) in values.iter().enumerate() {
        if v >= threshold {
            start.get_or_insert(i);
            sum += v;
        } else if let Some(s) = start.take() {
            if i - s >= MIN_RUN_LENGTH {
                runs.push((s, i - 1, sum / (i - s) as f64));
            }
            sum = 0.0;
        }
    }
    if let Some(s) = start {
        let len = values.len() - s;
        if len >= MIN_RUN_LENGTH {
            runs.push((s, values.len() - 1, sum / len as f64));
        }
    }
    runs
}

fn scoring_candidates(store: &Store, ts: &TimeSeries, threshold: f64) -> Result<Vec<NewAnomaly>> {
    let mut found = Vec::new();
    for channel in &ts.channels {
        let points = query_series(store, &SeriesQuery::new(&ts.id, channel))?;
        let processed: Vec<f64> = points.iter().filter_map(|p| p.ensemble_processed).collect();
        if processed.len() != points.len() {
            continue;
        }
        for (first, last, score) in runs_above(&processed, threshold) {
            found.push(base(
                ts,
                channel,
                points[first].timestamp,
                points[last].timestamp,
                last - first + 1,
                score,
            ));
        }
    }
    Ok(found)
}

fn classification_candidates(store: &Store, ts: &TimeSeries, bucket: &Bucket) -> Result<Vec<NewAnomaly>> {
    let classifiers = store
        .list_algorithms(&bucket.id)?
        .into_iter()
        .filter(|a| a.algorithm_type == AnalysisType::Classification)
        .count();
    if classifiers == 0 {
        return Ok(Vec::new());
    }
    let granularity = bucket.classification_granularity;
    let mut found = Vec::new();
    for channel in &ts.channels {
        let mut votes: HashMap<Option<String>, usize> = HashMap::new();
        for c in store.classifications(&ts.id, channel)? {
            *votes.entry(c.date_trunc).or_default() += 1;
        }
        if votes.is_empty() {
            continue;
        }
        for segment in series_segments(store, &ts.id, channel, granularity)? {
            let positive = votes.get(&segment.label).copied().unwrap_or(0);
            let flagged = match bucket.classification_ensemble {
                ClassificationEnsemble::Majority => positive as f64 / classifiers as f64 > 0.5,
                ClassificationEnsemble::Max => positive >= 1,
            };
            if flagged {
                found.push(base(ts, channel, segment.start, segment.end, segment.values.len(), 1.0));
            }
        }
    }
    Ok(found)
}

/// Drops candidates contained in, or overlapping by at least
/// [`OVERLAP_LIMIT`], a kept anomaly of the same channel.
pub fn filter_known(candidates: Vec<NewAnomaly>, kept: &[Anomaly]) -> Vec<NewAnomaly> {
    candidates
        .into_iter()
        .filter(|c| {
            let (s1, e1) = (c.start.timestamp_millis(), c.end.timestamp_millis());
            !kept.iter().filter(|k| k.channel == c.channel).any(|k| {
                let (s2, e2) = (k.start.timestamp_millis(), k.end.timestamp_millis());
                let contained = s1 >= s2 && e1 <= e2;
                contained || overlap(s1, e1, s2, e2) >= OVERLAP_LIMIT
            })
        })
        .collect()
}

/// Extracts and stores the anomalies of one series. Returns how many were
/// inserted.
pub fn extract_anomalies(store: &Store, ts_id: &str) -> Result<usize> {
    let ts = store.get_time_series(ts_id)?;
    let bucket = store.get_bucket(&ts.bucket_id)?;
    let candidates = match bucket.bucket_type {
        AnalysisType::Scoring => scoring_candidates(store, &ts, bucket.threshold)?,
        AnalysisType::Classification => classification_candidates(store, &ts, &bucket)?,
    };
    if candidates.is_empty() {
        return Ok(0);
    }
    let mut filter = AnomalyFilter::series(&ts.id);
    filter.only_kept = true;
    let kept = store.list_anomalies(&filter)?;
    let fresh = filter_known(candidates, &kept);
    let inserted = store.insert_anomalies(&bucket.id, &fresh)?;
    tracing::info!("extraction: {inserted} anomalies for series {} ({})", ts.name, ts.id);
    Ok(inserted)
}

pub fn extract_bucket_anomalies(store: &Store, bucket_id: &str) -> Result<usize> {
    let mut total = 0;
    for ts in store.list_time_series(bucket_id)? {
        total += extract_anomalies(store, &ts.id)?;
    }
    Ok(total)
}
