//! Splits series channels into classification segments.
//!
//! Segment boundaries follow the bucket's classification granularity: a
//! point belongs to the segment labelled with its truncated timestamp.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::cache::{CacheKey, DatasetKind};
use crate::error::{AnalysisError, Result};
use crate::models::{Bucket, Granularity, Segment, TimeWindow};
use crate::signal::{DistanceMatrix, euclidean_distance_matrix, min_max_scale, resample};
use crate::store::Store;

/// Segments with fewer points are not classified.
pub const MIN_SEGMENT_POINTS: usize = 10;
/// Every classified segment is resampled to this many values.
pub const SEGMENT_LENGTH: usize = 100;

/// Label of the segment containing `t`, `None` for `full`.
pub fn truncate_label(t: DateTime<Utc>, granularity: Granularity) -> Option<String> {
    let format = match granularity {
        Granularity::Full => return None,
        Granularity::Month => "%Y-%m",
        Granularity::Day => "%Y-%m-%d",
        Granularity::Hour => "%Y-%m-%dT%H",
        Granularity::Minute => "%Y-%m-%dT%H:%M",
    };
    Some(t.format(format).to_string())
}

/// `[start, end)` of the segment named by `label`.
pub fn label_range(label: &str, granularity: Granularity) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let bad = || AnalysisError::invalid("date", format!("'{label}' is not a {granularity} label"));
    let start: NaiveDateTime = match granularity {
        Granularity::Full => return Err(bad()),
        Granularity::Month => NaiveDate::parse_from_str(&format!("{label}-01"), "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(bad)?,
        Granularity::Day => NaiveDate::parse_from_str(label, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(bad)?,
        Granularity::Hour => {
            NaiveDateTime::parse_from_str(&format!("{label}:00"), "%Y-%m-%dT%H:%M").map_err(|_| bad())?
        }
        Granularity::Minute => NaiveDateTime::parse_from_str(label, "%Y-%m-%dT%H:%M").map_err(|_| bad())?,
    };
    let end = match granularity {
        Granularity::Month => {
            let (y, m) = if start.month() == 12 {
                (start.year() + 1, 1)
            } else {
                (start.year(), start.month() + 1)
            };
            NaiveDate::from_ymd_opt(y, m, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .ok_or_else(bad)?
        }
        Granularity::Day => start + Duration::days(1),
        Granularity::Hour => start + Duration::hours(1),
        _ => start + Duration::minutes(1),
    };
    Ok((Utc.from_utc_datetime(&start), Utc.from_utc_datetime(&end)))
}

/// Raw segments of one series channel in time order. At `full` the whole
/// channel is a single segment. Values are not resampled and `normal` is
/// unset.
pub fn series_segments(
    store: &Store,
    ts_id: &str,
    channel: &str,
    granularity: Granularity,
) -> Result<Vec<Segment>> {
    let points = store.channel_points(ts_id, channel, &TimeWindow::default())?;
    // Labels are zero-padded, so their order is time order.
    let mut groups: BTreeMap<Option<String>, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
    for (t, v) in points {
        groups.entry(truncate_label(t, granularity)).or_default().push((t, v));
    }
    Ok(groups
        .into_iter()
        .filter_map(|(label, pts)| {
            let start = pts.first()?.0;
            let end = pts.last()?.0;
            Some(Segment {
                ts_id: ts_id.to_string(),
                channel: channel.to_string(),
                label,
                start,
                end,
                values: pts.into_iter().map(|(_, v)| v).collect(),
                normal: false,
            })
        })
        .collect())
}

/// Classifiable segments of every series in the bucket for `channel`:
/// segments of at least [`MIN_SEGMENT_POINTS`] points, resampled to
/// [`SEGMENT_LENGTH`] values, flagged normal from the series' nominals.
pub fn bucket_segments(store: &Store, bucket: &Bucket, channel: &str) -> Result<Vec<Segment>> {
    let granularity = bucket.classification_granularity;
    let mut out = Vec::new();
    for ts in store.list_time_series(&bucket.id)? {
        if !ts.channels.iter().any(|c| c == channel) {
            continue;
        }
        let nominals = store.list_nominals(&ts.id, Some(channel))?;
        let normal_dates: HashSet<Option<String>> = nominals.into_iter().map(|n| n.date).collect();
        for mut segment in series_segments(store, &ts.id, channel, granularity)? {
            if segment.values.len() < MIN_SEGMENT_POINTS {
                continue;
            }
            segment.values = resample(&segment.values, SEGMENT_LENGTH);
            segment.normal = match granularity {
                Granularity::Full => !normal_dates.is_empty(),
                _ => normal_dates.contains(&segment.label),
            };
            out.push(segment);
        }
    }
    Ok(out)
}

/// Euclidean distances between min-max normalized segments, cached per
/// bucket and channel.
pub fn segment_distances(
    store: &Store,
    bucket_id: &str,
    channel: &str,
    segments: &[Segment],
) -> Result<Arc<DistanceMatrix>> {
    let key = CacheKey::scoped(bucket_id, DatasetKind::SegmentsDistance, channel);
    store.cache().distances_or_compute(key, || {
        let scaled: Vec<Vec<f64>> = segments.iter().map(|s| min_max_scale(&s.values)).collect();
        Ok(euclidean_distance_matrix(&scaled))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisType, DataPoint};
    use crate::store::tests::{start_time, test_store};

    fn hourly(t0: DateTime<Utc>, hours: i64, per_hour: i64) -> Vec<DataPoint> {
        (0..hours * per_hour)
            .map(|i| DataPoint {
                timestamp: t0 + Duration::minutes(i * 60 / per_hour),
                values: BTreeMap::from([("v".to_string(), i as f64)]),
            })
            .collect()
    }

    #[test]
    fn test_truncate_labels() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 14, 27, 31).unwrap();
        assert_eq!(truncate_label(t, Granularity::Full), None);
        assert_eq!(truncate_label(t, Granularity::Month).unwrap(), "2024-03");
        assert_eq!(truncate_label(t, Granularity::Day).unwrap(), "2024-03-05");
        assert_eq!(truncate_label(t, Granularity::Hour).unwrap(), "2024-03-05T14");
        assert_eq!(truncate_label(t, Granularity::Minute).unwrap(), "2024-03-05T14:27");
    }

    #[test]
    fn test_label_range() {
        let (s, e) = label_range("2024-12", Granularity::Month).unwrap();
        assert_eq!(s, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(e, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());

        let (s, e) = label_range("2024-03-05T14", Granularity::Hour).unwrap();
        assert_eq!(s, Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap());
        assert_eq!(e - s, Duration::hours(1));

        assert!(label_range("garbage", Granularity::Day).is_err());
        assert!(label_range("2024-03", Granularity::Full).is_err());
    }

    #[test]
    fn test_label_round_trips_through_range() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 14, 27, 31).unwrap();
        for g in [Granularity::Month, Granularity::Day, Granularity::Hour, Granularity::Minute] {
            let label = truncate_label(t, g).unwrap();
            let (s, e) = label_range(&label, g).unwrap();
            assert!(s <= t && t < e, "{g}");
        }
    }

    #[test]
    fn test_bucket_segments_skip_short_and_mark_normal() {
        let store = test_store();
        let bucket_id = store
            .create_bucket("c", AnalysisType::Classification, Granularity::Hour, 0.5, 11, &[])
            .unwrap();
        let bucket = store.get_bucket(&bucket_id).unwrap();
        let ts = store.create_time_series(&bucket_id, "s", &["v".to_string()]).unwrap();

        let mut points = hourly(start_time(), 2, 12);
        // a third hour with too few points
        points.extend(hourly(start_time() + Duration::hours(2), 1, 3));
        store.append_points(&ts, &points).unwrap();
        store
            .toggle_nominal(&ts, "v", Granularity::Hour, Some("2024-03-01T00"))
            .unwrap();

        let segments = bucket_segments(&store, &bucket, "v").unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.values.len() == SEGMENT_LENGTH));
        assert!(segments[0].normal);
        assert!(!segments[1].normal);
        assert_eq!(segments[1].label.as_deref(), Some("2024-03-01T01"));
    }

    #[test]
    fn test_full_granularity_is_one_segment_per_series() {
        let store = test_store();
        let bucket_id = store
            .create_bucket("c", AnalysisType::Classification, Granularity::Full, 0.5, 11, &[])
            .unwrap();
        let bucket = store.get_bucket(&bucket_id).unwrap();
        let mut ids = Vec::new();
        for name in ["a", "b"] {
            let ts = store.create_time_series(&bucket_id, name, &["v".to_string()]).unwrap();
            // crosses midnight, still one segment
            store.append_points(&ts, &hourly(start_time() + Duration::hours(23), 2, 10)).unwrap();
            ids.push(ts);
        }

        let raw = series_segments(&store, &ids[0], "v", Granularity::Full).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].label, None);
        assert_eq!(raw[0].values.len(), 20);
        assert_eq!(raw[0].start, start_time() + Duration::hours(23));

        store.toggle_nominal(&ids[1], "v", Granularity::Full, None).unwrap();
        let segments = bucket_segments(&store, &bucket, "v").unwrap();
        assert_eq!(segments.len(), 2);
        assert!(!segments[0].normal);
        assert!(segments[1].normal);
        assert!(segments.iter().all(|s| s.values.len() == SEGMENT_LENGTH));
    }

    #[test]
    fn test_segment_distances_are_cached() {
        let store = test_store();
        let bucket_id = store
            .create_bucket("c", AnalysisType::Classification, Granularity::Full, 0.5, 11, &[])
            .unwrap();
        let bucket = store.get_bucket(&bucket_id).unwrap();
        for name in ["a", "b"] {
            let ts = store.create_time_series(&bucket_id, name, &["v".to_string()]).unwrap();
            store.append_points(&ts, &hourly(start_time(), 1, 20)).unwrap();
        }
        let segments = bucket_segments(&store, &bucket, "v").unwrap();
        let first = segment_distances(&store, &bucket_id, "v", &segments).unwrap();
        let second = segment_distances(&store, &bucket_id, "v", &[]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
        assert_eq!(first.get(0, 1), 0.0);
    }
}
