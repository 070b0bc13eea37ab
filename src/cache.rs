//! Memoization of distance matrices and cluster trees per bucket.
//!
//! Entries are advisory: a miss only means "recompute". Every store entry
//! point that mutates time series or anomalies of a bucket calls
//! [`AnalysisCache::invalidate`] for that bucket.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::signal::DistanceMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    AnomaliesDistance,
    TimeseriesDistance,
    SegmentsDistance,
    ClusterTree,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::AnomaliesDistance => "anomalies-distance",
            DatasetKind::TimeseriesDistance => "timeseries-distance",
            DatasetKind::SegmentsDistance => "segments-distance",
            DatasetKind::ClusterTree => "cluster-tree",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache key. `scope` narrows a kind further (a channel, or which dataset a
/// cluster tree was built from); it is empty when the kind needs no scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub bucket_id: String,
    pub kind: DatasetKind,
    pub scope: String,
}

impl CacheKey {
    pub fn new(bucket_id: &str, kind: DatasetKind) -> Self {
        Self {
            bucket_id: bucket_id.to_string(),
            kind,
            scope: String::new(),
        }
    }

    pub fn scoped(bucket_id: &str, kind: DatasetKind, scope: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.to_string(),
            kind,
            scope: scope.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CacheValue {
    Distances(Arc<DistanceMatrix>),
    Tree(Arc<Value>),
}

#[derive(Default)]
pub struct AnalysisCache {
    entries: RwLock<HashMap<CacheKey, CacheValue>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        // A poisoned lock is a miss, never an error.
        self.entries.read().ok()?.get(key).cloned()
    }

    pub fn put(&self, key: CacheKey, value: CacheValue) {
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(key, value);
            }
            Err(_) => tracing::warn!("cache: lock poisoned, dropping entry for {}", key.kind),
        }
    }

    /// Purges every dataset kind cached for `bucket_id`.
    pub fn invalidate(&self, bucket_id: &str) {
        let removed = match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|k, _| k.bucket_id != bucket_id);
                before - entries.len()
            }
            Err(poisoned) => {
                // Clearing everything keeps stale data from being served.
                let mut entries = poisoned.into_inner();
                let before = entries.len();
                entries.clear();
                before
            }
        };
        if removed > 0 {
            tracing::debug!("cache: invalidated {removed} entries for bucket {bucket_id}");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached matrix for `key`, or runs `compute` and caches its result.
    pub fn distances_or_compute(
        &self,
        key: CacheKey,
        compute: impl FnOnce() -> Result<DistanceMatrix>,
    ) -> Result<Arc<DistanceMatrix>> {
        if let Some(CacheValue::Distances(m)) = self.get(&key) {
            tracing::debug!("cache: hit {} for bucket {}", key.kind, key.bucket_id);
            return Ok(m);
        }
        let matrix = Arc::new(compute()?);
        self.put(key, CacheValue::Distances(matrix.clone()));
        Ok(matrix)
    }

    pub fn tree_or_compute(
        &self,
        key: CacheKey,
        compute: impl FnOnce() -> Result<Option<Value>>,
    ) -> Result<Option<Arc<Value>>> {
        if let Some(CacheValue::Tree(t)) = self.get(&key) {
            return Ok(Some(t));
        }
        let Some(tree) = compute()? else {
            return Ok(None);
        };
        let tree = Arc::new(tree);
        self.put(key, CacheValue::Tree(tree.clone()));
        Ok(Some(tree))
    }
}
