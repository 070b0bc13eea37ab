//! Hierarchical clustering of anomalies or whole series.
//!
//! Items are compared with DTW and the matrix is cached per bucket. Ward
//! linkage turns it into a binary tree; leaf ids are item positions and the
//! i-th merge gets id `n + i`. The anomaly matrix also drives the
//! recommenders at the bottom of this module.

use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::cache::{CacheKey, DatasetKind};
use crate::error::{AnalysisError, Result};
use crate::models::{Anomaly, AnomalyFilter, TimeWindow};
use crate::signal::{CondensedMatrix, DistanceMatrix, dtw_distance, dtw_distance_matrix, min_max_scale};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterSource {
    Anomalies,
    TimeSeries { channel: String },
}

impl ClusterSource {
    fn distance_key(&self, bucket_id: &str) -> CacheKey {
        match self {
            ClusterSource::Anomalies => CacheKey::new(bucket_id, DatasetKind::AnomaliesDistance),
            ClusterSource::TimeSeries { channel } => {
                CacheKey::scoped(bucket_id, DatasetKind::TimeseriesDistance, channel.as_str())
            }
        }
    }

    fn tree_key(&self, bucket_id: &str) -> CacheKey {
        let scope = match self {
            ClusterSource::Anomalies => "anomalies".to_string(),
            ClusterSource::TimeSeries { channel } => format!("timeseries:{channel}"),
        };
        CacheKey::scoped(bucket_id, DatasetKind::ClusterTree, scope)
    }
}

// ── Severity ──

/// Euclidean norm of the independently min-max scaled score and length of
/// each anomaly.
pub fn severities(anomalies: &[Anomaly]) -> Vec<f64> {
    let scores = min_max_scale(&anomalies.iter().map(|a| a.score).collect::<Vec<_>>());
    let lengths = min_max_scale(&anomalies.iter().map(|a| a.length as f64).collect::<Vec<_>>());
    scores
        .iter()
        .zip(&lengths)
        .map(|(s, l)| (s * s + l * l).sqrt())
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedAnomaly {
    #[serde(flatten)]
    pub anomaly: Anomaly,
    pub severity: f64,
}

pub fn anomalies_with_severity(store: &Store, filter: &AnomalyFilter) -> Result<Vec<RankedAnomaly>> {
    let anomalies = store.list_anomalies(filter)?;
    let severity = severities(&anomalies);
    Ok(anomalies
        .into_iter()
        .zip(severity)
        .map(|(anomaly, severity)| RankedAnomaly { anomaly, severity })
        .collect())
}

/// Anomaly ids of the bucket ordered by rating plus min-max scaled severity,
/// highest first.
pub fn severity_ranking(store: &Store, bucket_id: &str) -> Result<Vec<(String, f64)>> {
    let ranked = anomalies_with_severity(store, &AnomalyFilter::bucket(bucket_id))?;
    let scaled = min_max_scale(&ranked.iter().map(|r| r.severity).collect::<Vec<_>>());
    let mut out: Vec<(String, f64)> = ranked
        .into_iter()
        .zip(scaled)
        .map(|(r, s)| (r.anomaly.id, r.anomaly.rating as f64 + s))
        .collect();
    out.sort_by(|a, b| b.1.total_cmp(&a.1));
    Ok(out)
}

// ── Ward linkage ──

/// One agglomeration step. `left < right`, both node ids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub dist: f64,
    pub size: usize,
}

/// Ward linkage over a condensed distance matrix.
///
/// Pairs are found with the nearest-neighbour chain and distances updated
/// with the Lance–Williams recurrence. The merges are then ordered by
/// distance (stable, so ties keep discovery order) and labelled.
pub fn ward_linkage(condensed: &CondensedMatrix) -> Vec<Merge> {
    let n = condensed.size();
    if n < 2 {
        return Vec::new();
    }
    let mut dist: Vec<f64> = (0..n * n).map(|k| condensed.get(k / n, k % n)).collect();
    // slot -> cluster size, 0 once merged away
    let mut size = vec![1usize; n];
    let mut chain: Vec<usize> = Vec::with_capacity(n);
    let mut found: Vec<(usize, usize, f64)> = Vec::with_capacity(n - 1);

    for _ in 0..n - 1 {
        if chain.is_empty() {
            let Some(first) = size.iter().position(|s| *s > 0) else {
                break;
            };
            chain.push(first);
        }
        let (x, y, d_xy) = loop {
            let x = chain[chain.len() - 1];
            let prev = chain.len().checked_sub(2).map(|k| chain[k]);
            let mut nearest = prev.map(|p| (p, dist[x * n + p]));
            for i in 0..n {
                if size[i] == 0 || i == x {
                    continue;
                }
                let d = dist[x * n + i];
                if nearest.is_none_or(|(_, best)| d < best) {
                    nearest = Some((i, d));
                }
            }
            let Some((y, d)) = nearest else {
                return label_merges(n, found);
            };
            if prev == Some(y) {
                chain.truncate(chain.len() - 2);
                break (x.min(y), x.max(y), d);
            }
            chain.push(y);
        };

        // the merged cluster lives on in slot y
        let (n_x, n_y) = (size[x], size[y]);
        for k in 0..n {
            if size[k] == 0 || k == x || k == y {
                continue;
            }
            let n_k = size[k];
            let t = (n_x + n_y + n_k) as f64;
            let updated = ((n_x + n_k) as f64 * dist[x * n + k].powi(2)
                + (n_y + n_k) as f64 * dist[y * n + k].powi(2)
                - n_k as f64 * d_xy.powi(2))
                / t;
            let updated = updated.max(0.0).sqrt();
            dist[y * n + k] = updated;
            dist[k * n + y] = updated;
        }
        size[x] = 0;
        size[y] = n_x + n_y;
        found.push((x, y, d_xy));
    }
    label_merges(n, found)
}

/// Sorts slot-pair merges by distance and names the clusters they join.
fn label_merges(n: usize, mut found: Vec<(usize, usize, f64)>) -> Vec<Merge> {
    found.sort_by(|a, b| a.2.total_cmp(&b.2));
    let mut parent: Vec<usize> = (0..n + found.len()).collect();
    let mut sizes = vec![1usize; n + found.len()];

    fn root(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    found
        .iter()
        .enumerate()
        .map(|(step, &(x, y, dist))| {
            let a = root(&mut parent, x);
            let b = root(&mut parent, y);
            let id = n + step;
            parent[a] = id;
            parent[b] = id;
            sizes[id] = sizes[a] + sizes[b];
            Merge {
                left: a.min(b),
                right: a.max(b),
                dist,
                size: sizes[id],
            }
        })
        .collect()
}

// ── Tree ──

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClusterNode {
    Leaf {
        id: usize,
        meta: Value,
    },
    Branch {
        id: usize,
        dist: f64,
        left: Box<ClusterNode>,
        right: Box<ClusterNode>,
    },
}

impl ClusterNode {
    pub fn id(&self) -> usize {
        match self {
            ClusterNode::Leaf { id, .. } | ClusterNode::Branch { id, .. } => *id,
        }
    }
}

/// Assembles the tree from the merge list; `None` with no merges.
pub fn build_tree(merges: &[Merge], meta: Vec<Value>) -> Option<ClusterNode> {
    let n = meta.len();
    let mut nodes: Vec<Option<ClusterNode>> = meta
        .into_iter()
        .enumerate()
        .map(|(id, meta)| Some(ClusterNode::Leaf { id, meta }))
        .collect();
    for (step, merge) in merges.iter().enumerate() {
        let left = nodes.get_mut(merge.left)?.take()?;
        let right = nodes.get_mut(merge.right)?.take()?;
        nodes.push(Some(ClusterNode::Branch {
            id: n + step,
            dist: merge.dist,
            left: Box::new(left),
            right: Box::new(right),
        }));
    }
    if merges.is_empty() {
        return None;
    }
    nodes.pop().flatten()
}

/// Channel values inside the anomaly's range.
fn anomaly_values(store: &Store, anomaly: &Anomaly) -> Result<Vec<f64>> {
    let window = TimeWindow::between(anomaly.start, anomaly.end);
    Ok(store
        .channel_points(&anomaly.ts_id, &anomaly.channel, &window)?
        .into_iter()
        .map(|(_, v)| v)
        .collect())
}

/// Values and leaf metadata of every item of `source` in the bucket.
fn clustering_data(store: &Store, bucket_id: &str, source: &ClusterSource) -> Result<(Vec<Vec<f64>>, Vec<Value>)> {
    let mut data = Vec::new();
    let mut meta = Vec::new();
    match source {
        ClusterSource::Anomalies => {
            for ranked in anomalies_with_severity(store, &AnomalyFilter::bucket(bucket_id))? {
                let a = &ranked.anomaly;
                data.push(anomaly_values(store, a)?);
                meta.push(json!({
                    "anomaly_id": a.id,
                    "score": a.score,
                    "length": a.length,
                    "rating": a.rating,
                    "severity": ranked.severity,
                }));
            }
        }
        ClusterSource::TimeSeries { channel } => {
            for ts in store.list_time_series(bucket_id)? {
                if !ts.channels.contains(channel) {
                    continue;
                }
                data.push(
                    store
                        .channel_points(&ts.id, channel, &TimeWindow::default())?
                        .into_iter()
                        .map(|(_, v)| v)
                        .collect(),
                );
                meta.push(json!({ "ts_id": ts.id, "name": ts.name }));
            }
        }
    }
    Ok((data, meta))
}

/// DTW distance matrix of the bucket's items, served from cache when present.
pub fn distance_matrix(
    store: &Store,
    bucket_id: &str,
    source: &ClusterSource,
    data: &[Vec<f64>],
) -> Result<Arc<DistanceMatrix>> {
    store
        .cache()
        .distances_or_compute(source.distance_key(bucket_id), || Ok(dtw_distance_matrix(data)))
}

fn check_coverage(matrix: &DistanceMatrix, items: usize) -> Result<()> {
    if matrix.len() != items {
        return Err(AnalysisError::invalid(
            "distance matrix",
            format!("cached matrix covers {} items, bucket has {items}", matrix.len()),
        ));
    }
    Ok(())
}

/// Serialized cluster tree of the bucket's items, or `None` when there are
/// fewer than two items.
pub fn cluster(store: &Store, bucket_id: &str, source: &ClusterSource) -> Result<Option<Arc<Value>>> {
    store.get_bucket(bucket_id)?;
    store.cache().tree_or_compute(source.tree_key(bucket_id), || {
        let (data, meta) = clustering_data(store, bucket_id, source)?;
        if data.len() < 2 {
            tracing::debug!("clustering: nothing to cluster in bucket {bucket_id}");
            return Ok(None);
        }
        let matrix = distance_matrix(store, bucket_id, source, &data)?;
        check_coverage(&matrix, data.len())?;
        let merges = ward_linkage(&matrix.condensed());
        let Some(tree) = build_tree(&merges, meta) else {
            return Ok(None);
        };
        Ok(Some(serde_json::to_value(&tree)?))
    })
}

// ── Recommendations ──

/// Rating bounds; estimates map them onto `[0, 1]`.
const MIN_RATING: f64 = -5.0;
const MAX_RATING: f64 = 5.0;

pub const DEFAULT_BOOKMARK_DISTANCE: f64 = 0.3;
pub const DEFAULT_LENGTH_TOLERANCE: f64 = 0.1;

/// The bucket's anomalies and their DTW matrix, row `i` belonging to the
/// i-th anomaly.
fn anomaly_distances(store: &Store, bucket_id: &str) -> Result<(Vec<RankedAnomaly>, Arc<DistanceMatrix>)> {
    store.get_bucket(bucket_id)?;
    let ranked = anomalies_with_severity(store, &AnomalyFilter::bucket(bucket_id))?;
    let data = ranked
        .iter()
        .map(|r| anomaly_values(store, &r.anomaly))
        .collect::<Result<Vec<_>>>()?;
    let matrix = distance_matrix(store, bucket_id, &ClusterSource::Anomalies, &data)?;
    check_coverage(&matrix, data.len())?;
    Ok((ranked, matrix))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub anomaly_id: String,
    /// Best first.
    pub suggestions: Vec<String>,
}

/// For every anomaly of the bucket, the `k` others that differ most in
/// shape while being closest in length.
///
/// Entries are ordered by scaled rating plus scaled severity, highest first.
/// With `only_unrated` rated anomalies are never suggested.
pub fn dissimilar_recommendations(
    store: &Store,
    bucket_id: &str,
    k: usize,
    only_unrated: bool,
) -> Result<Vec<Recommendation>> {
    let (ranked, matrix) = anomaly_distances(store, bucket_id)?;
    let ratings = min_max_scale(&ranked.iter().map(|r| r.anomaly.rating as f64).collect::<Vec<_>>());
    let severity = min_max_scale(&ranked.iter().map(|r| r.severity).collect::<Vec<_>>());
    let mut order: Vec<(usize, f64)> = ratings.iter().zip(&severity).map(|(r, s)| r + s).enumerate().collect();
    order.sort_by(|a, b| b.1.total_cmp(&a.1));

    Ok(order
        .into_iter()
        .map(|(i, _)| {
            let shape = min_max_scale(matrix.row(i));
            let length = ranked[i].anomaly.length;
            let gaps: Vec<f64> = ranked.iter().map(|r| (r.anomaly.length - length).abs() as f64).collect();
            let gaps = min_max_scale(&gaps);
            let mut candidates: Vec<(usize, f64)> = (0..ranked.len())
                .filter(|&j| j != i && (!only_unrated || ranked[j].anomaly.rating == 0))
                .map(|j| (j, shape[j] + 1.0 - gaps[j]))
                .collect();
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
            Recommendation {
                anomaly_id: ranked[i].anomaly.id.clone(),
                suggestions: candidates
                    .into_iter()
                    .take(k)
                    .map(|(j, _)| ranked[j].anomaly.id.clone())
                    .collect(),
            }
        })
        .collect())
}

/// Estimated rating of every anomaly of the bucket from the ratings of its
/// `k` most similar other anomalies, min-max scaled, highest first.
///
/// Similarity is one minus the DTW distance scaled within its matrix
/// column. The estimate is the similarity-weighted mean of the neighbours'
/// ratings; without any similar neighbour it is 0.
pub fn estimate_ratings(store: &Store, bucket_id: &str, k: usize) -> Result<Vec<(String, f64)>> {
    let (ranked, matrix) = anomaly_distances(store, bucket_id)?;
    let n = ranked.len();
    // symmetric, so column j is row j
    let scaled_columns: Vec<Vec<f64>> = (0..n).map(|j| min_max_scale(matrix.row(j))).collect();
    let similarity = |i: usize, j: usize| 1.0 - scaled_columns[j][i];
    let ratings: Vec<f64> = ranked
        .iter()
        .map(|r| (r.anomaly.rating as f64 - MIN_RATING) / (MAX_RATING - MIN_RATING))
        .collect();

    let estimates: Vec<f64> = (0..n)
        .map(|i| {
            let mut neighbours: Vec<usize> = (0..n).filter(|&j| j != i).collect();
            neighbours.sort_by(|a, b| similarity(i, *b).total_cmp(&similarity(i, *a)));
            neighbours.truncate(k);
            let total: f64 = neighbours.iter().map(|&j| similarity(i, j).abs()).sum();
            if total > 0.0 {
                neighbours.iter().map(|&j| similarity(i, j) * ratings[j]).sum::<f64>() / total
            } else {
                0.0
            }
        })
        .collect();

    let mut out: Vec<(String, f64)> = ranked
        .into_iter()
        .zip(min_max_scale(&estimates))
        .map(|(r, e)| (r.anomaly.id, e))
        .collect();
    out.sort_by(|a, b| b.1.total_cmp(&a.1));
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarBookmark {
    pub distance: f64,
    pub anomaly: Anomaly,
}

/// Bookmarked anomalies of the same bucket and channel that resemble
/// `anomaly_id`, nearest first.
///
/// A bookmark qualifies when its length differs from the anomaly's by at
/// most `length_tolerance` of their mean length, and the DTW distance of the
/// two min-max scaled shapes is below `max_distance` times that mean length.
pub fn find_similar_bookmarks(
    store: &Store,
    anomaly_id: &str,
    max_distance: f64,
    length_tolerance: f64,
) -> Result<Vec<SimilarBookmark>> {
    let anomaly = store.get_anomaly(anomaly_id)?;
    let shape = min_max_scale(&anomaly_values(store, &anomaly)?);
    let filter = AnomalyFilter {
        bucket_id: Some(anomaly.bucket_id.clone()),
        only_bookmarked: true,
        ..Default::default()
    };

    let mut out = Vec::new();
    for bookmark in store.list_anomalies(&filter)? {
        if bookmark.id == anomaly.id || bookmark.channel != anomaly.channel {
            continue;
        }
        let other = anomaly_values(store, &bookmark)?;
        let mean_len = (other.len() + shape.len()) as f64 / 2.0;
        if mean_len == 0.0 || shape.len().abs_diff(other.len()) as f64 / mean_len > length_tolerance {
            continue;
        }
        let distance = dtw_distance(&min_max_scale(&other), &shape);
        if distance < mean_len * max_distance {
            out.push(SimilarBookmark { distance, anomaly: bookmark });
        }
    }
    out.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    Ok(out)
}
