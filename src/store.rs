use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::AnalysisCache;
use crate::config::AlgorithmTemplate;
use crate::error::{AnalysisError, Result};
use crate::models::*;

/// SQLite-backed collections: buckets, algorithms, time series, points,
/// scores, classifications, anomalies and nominals.
///
/// Every method that changes time series or anomaly data invalidates the
/// owning bucket's cache entries before returning.
pub struct Store {
    conn: Mutex<Connection>,
    cache: Arc<AnalysisCache>,
}

pub(crate) fn now_string() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parses a text column holding one of the model enums.
fn parse_column<T: std::str::FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

const BUCKET_COLUMNS: &str = "id, name, bucket_type, classification_granularity, threshold, \
                              smoothing_window, classification_ensemble, created_at";

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<Bucket> {
    Ok(Bucket {
        id: row.get(0)?,
        name: row.get(1)?,
        bucket_type: parse_column(row, 2)?,
        classification_granularity: parse_column(row, 3)?,
        threshold: row.get(4)?,
        smoothing_window: row.get::<_, i64>(5)?.max(0) as usize,
        classification_ensemble: parse_column(row, 6)?,
        created_at: row.get(7)?,
    })
}

const ALGORITHM_COLUMNS: &str =
    "id, bucket_id, name, algorithm, algorithm_type, parameters, weight, created_at";

fn algorithm_from_row(row: &Row<'_>) -> rusqlite::Result<Algorithm> {
    Ok(Algorithm {
        id: row.get(0)?,
        bucket_id: row.get(1)?,
        name: row.get(2)?,
        algorithm: row.get(3)?,
        algorithm_type: parse_column(row, 4)?,
        parameters: json_column(row, 5)?,
        weight: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn series_from_row(row: &Row<'_>) -> rusqlite::Result<TimeSeries> {
    Ok(TimeSeries {
        id: row.get(0)?,
        bucket_id: row.get(1)?,
        name: row.get(2)?,
        channels: json_column(row, 3)?,
        created_at: row.get(4)?,
    })
}

const ANOMALY_COLUMNS: &str = "id, ts_id, bucket_id, channel, start_ms, end_ms, length, score, \
                               keep, bookmark, manual, rating, views";

fn anomaly_from_row(row: &Row<'_>) -> rusqlite::Result<Anomaly> {
    Ok(Anomaly {
        id: row.get(0)?,
        ts_id: row.get(1)?,
        bucket_id: row.get(2)?,
        channel: row.get(3)?,
        start: from_millis(row.get(4)?),
        end: from_millis(row.get(5)?),
        length: row.get(6)?,
        score: row.get(7)?,
        keep: row.get(8)?,
        bookmark: row.get(9)?,
        manual: row.get(10)?,
        rating: row.get(11)?,
        views: row.get(12)?,
    })
}

impl Store {
    pub fn open(path: &str, cache: Arc<AnalysisCache>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
            cache,
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory(cache: Arc<AnalysisCache>) -> Result<Self> {
        Self::open(":memory:", cache)
    }

    pub fn cache(&self) -> &Arc<AnalysisCache> {
        &self.cache
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock()?)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS buckets (
                id                         TEXT PRIMARY KEY,
                name                       TEXT NOT NULL,
                bucket_type                TEXT NOT NULL CHECK(bucket_type IN ('scoring','classification')),
                classification_granularity TEXT NOT NULL DEFAULT 'full'
                    CHECK(classification_granularity IN ('full','month','day','hour','minute')),
                threshold                  REAL NOT NULL,
                smoothing_window           INTEGER NOT NULL,
                classification_ensemble    TEXT NOT NULL DEFAULT 'majority'
                    CHECK(classification_ensemble IN ('majority','max')),
                created_at                 TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS algorithms (
                id             TEXT PRIMARY KEY,
                bucket_id      TEXT NOT NULL REFERENCES buckets(id) ON DELETE CASCADE,
                name           TEXT NOT NULL,
                algorithm      TEXT NOT NULL,
                algorithm_type TEXT NOT NULL CHECK(algorithm_type IN ('scoring','classification')),
                parameters     TEXT NOT NULL DEFAULT '{}',
                weight         REAL,
                created_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_algorithms_bucket ON algorithms(bucket_id);

            CREATE TABLE IF NOT EXISTS time_series (
                id         TEXT PRIMARY KEY,
                bucket_id  TEXT NOT NULL REFERENCES buckets(id) ON DELETE CASCADE,
                name       TEXT NOT NULL,
                channels   TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_time_series_bucket ON time_series(bucket_id);

            CREATE TABLE IF NOT EXISTS time_series_data (
                ts_id     TEXT NOT NULL REFERENCES time_series(id) ON DELETE CASCADE,
                bucket_id TEXT NOT NULL,
                ts_ms     INTEGER NOT NULL,
                channel   TEXT NOT NULL,
                value     REAL NOT NULL,
                PRIMARY KEY (ts_id, channel, ts_ms)
            );
            CREATE INDEX IF NOT EXISTS idx_ts_data_bucket ON time_series_data(bucket_id, channel);

            CREATE TABLE IF NOT EXISTS anomaly_scores (
                ts_id        TEXT NOT NULL REFERENCES time_series(id) ON DELETE CASCADE,
                algorithm_id TEXT NOT NULL REFERENCES algorithms(id) ON DELETE CASCADE,
                bucket_id    TEXT NOT NULL,
                channel      TEXT NOT NULL,
                ts_ms        INTEGER NOT NULL,
                value        REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scores_series ON anomaly_scores(ts_id, algorithm_id, channel, ts_ms);
            CREATE INDEX IF NOT EXISTS idx_scores_baseline ON anomaly_scores(bucket_id, channel, algorithm_id);

            CREATE TABLE IF NOT EXISTS anomaly_classifications (
                id           TEXT PRIMARY KEY,
                ts_id        TEXT NOT NULL REFERENCES time_series(id) ON DELETE CASCADE,
                algorithm_id TEXT NOT NULL REFERENCES algorithms(id) ON DELETE CASCADE,
                channel      TEXT NOT NULL,
                date_trunc   TEXT,
                granularity  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_classifications_series ON anomaly_classifications(ts_id, channel);

            CREATE TABLE IF NOT EXISTS anomalies (
                id        TEXT PRIMARY KEY,
                ts_id     TEXT NOT NULL REFERENCES time_series(id) ON DELETE CASCADE,
                bucket_id TEXT NOT NULL,
                channel   TEXT NOT NULL,
                start_ms  INTEGER NOT NULL,
                end_ms    INTEGER NOT NULL,
                length    INTEGER NOT NULL,
                score     REAL NOT NULL,
                keep      INTEGER NOT NULL DEFAULT 0,
                bookmark  INTEGER NOT NULL DEFAULT 0,
                manual    INTEGER NOT NULL DEFAULT 0,
                rating    INTEGER NOT NULL DEFAULT 0,
                views     INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_anomalies_series ON anomalies(ts_id);
            CREATE INDEX IF NOT EXISTS idx_anomalies_bucket ON anomalies(bucket_id);

            CREATE TABLE IF NOT EXISTS nominals (
                id          TEXT PRIMARY KEY,
                ts_id       TEXT NOT NULL REFERENCES time_series(id) ON DELETE CASCADE,
                channel     TEXT NOT NULL,
                granularity TEXT NOT NULL,
                date        TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_nominals_series ON nominals(ts_id, channel);
            ",
        )?;
        Ok(())
    }

    // ── Buckets ──

    /// Creates a bucket and attaches the default algorithms of its type.
    pub fn create_bucket(
        &self,
        name: &str,
        bucket_type: AnalysisType,
        granularity: Granularity,
        threshold: f64,
        smoothing_window: usize,
        defaults: &[AlgorithmTemplate],
    ) -> Result<String> {
        let granularity = match bucket_type {
            AnalysisType::Scoring => Granularity::Full,
            AnalysisType::Classification => granularity,
        };
        let id = new_id();
        let now = now_string();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO buckets (id, name, bucket_type, classification_granularity, threshold, \
             smoothing_window, classification_ensemble, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'majority', ?7)",
            params![
                id,
                name,
                bucket_type.as_str(),
                granularity.as_str(),
                threshold,
                smoothing_window as i64,
                now
            ],
        )?;
        for template in defaults.iter().filter(|t| t.algorithm_type == bucket_type) {
            tx.execute(
                "INSERT INTO algorithms (id, bucket_id, name, algorithm, algorithm_type, parameters, weight, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new_id(),
                    id,
                    template.name,
                    template.key,
                    template.algorithm_type.as_str(),
                    serde_json::to_string(&template.parameters)?,
                    template.weight,
                    now
                ],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    pub fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUCKET_COLUMNS} FROM buckets ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map([], bucket_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn find_bucket(&self, id: &str) -> Result<Option<Bucket>> {
        let conn = self.conn()?;
        let bucket = conn
            .query_row(
                &format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE id = ?1"),
                params![id],
                bucket_from_row,
            )
            .optional()?;
        Ok(bucket)
    }

    pub fn get_bucket(&self, id: &str) -> Result<Bucket> {
        self.find_bucket(id)?
            .ok_or_else(|| AnalysisError::not_found("bucket", id))
    }

    fn update_bucket_column(&self, id: &str, column: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
        let conn = self.conn()?;
        let count = conn.execute(
            &format!("UPDATE buckets SET {column} = ?2 WHERE id = ?1"),
            params![id, value],
        )?;
        if count == 0 {
            return Err(AnalysisError::not_found("bucket", id));
        }
        Ok(())
    }

    pub fn rename_bucket(&self, id: &str, name: &str) -> Result<()> {
        self.update_bucket_column(id, "name", &name)
    }

    pub fn set_threshold(&self, id: &str, threshold: f64) -> Result<()> {
        self.update_bucket_column(id, "threshold", &threshold)
    }

    pub fn set_smoothing_window(&self, id: &str, window: usize) -> Result<()> {
        self.update_bucket_column(id, "smoothing_window", &(window as i64))
    }

    pub fn set_classification_ensemble(&self, id: &str, method: ClassificationEnsemble) -> Result<()> {
        self.update_bucket_column(id, "classification_ensemble", &method.as_str())
    }

    /// Deletes the bucket with everything it owns.
    pub fn delete_bucket(&self, id: &str) -> Result<bool> {
        let count = {
            let conn = self.conn()?;
            conn.execute("DELETE FROM buckets WHERE id = ?1", params![id])?
        };
        self.cache.invalidate(id);
        Ok(count > 0)
    }

    /// Union of the channels of every series in the bucket, sorted.
    pub fn bucket_channels(&self, bucket_id: &str) -> Result<Vec<String>> {
        let channels: BTreeSet<String> = self
            .list_time_series(bucket_id)?
            .into_iter()
            .flat_map(|ts| ts.channels)
            .collect();
        Ok(channels.into_iter().collect())
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
        let id = new_id();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO algorithms (id, bucket_id, name, algorithm, algorithm_type, parameters, weight, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                bucket_id,
                name,
                key,
                algorithm_type.as_str(),
                serde_json::to_string(parameters)?,
                weight,
                now_string()
            ],
        )?;
        Ok(id)
    }

    /// Algorithms of a bucket in creation order.
    pub fn list_algorithms(&self, bucket_id: &str) -> Result<Vec<Algorithm>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALGORITHM_COLUMNS} FROM algorithms WHERE bucket_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map(params![bucket_id], algorithm_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_algorithm(&self, id: &str) -> Result<Algorithm> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ALGORITHM_COLUMNS} FROM algorithms WHERE id = ?1"),
            params![id],
            algorithm_from_row,
        )
        .optional()?
        .ok_or_else(|| AnalysisError::not_found("algorithm", id))
    }

    pub fn update_algorithm(&self, id: &str, update: &UpdateAlgorithmRequest) -> Result<()> {
        let mut algo = self.get_algorithm(id)?;
        if let Some(name) = &update.name {
            algo.name = name.clone();
        }
        if let Some(weight) = update.weight {
            algo.weight = Some(weight);
        }
        if let Some(parameters) = &update.parameters {
            algo.parameters = parameters.clone();
        }
        let conn = self.conn()?;
        conn.execute(
            "UPDATE algorithms SET name = ?2, weight = ?3, parameters = ?4 WHERE id = ?1",
            params![id, algo.name, algo.weight, serde_json::to_string(&algo.parameters)?],
        )?;
        Ok(())
    }

    /// Deletes the algorithm; its scores and classifications go with it.
    pub fn delete_algorithm(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count = conn.execute("DELETE FROM algorithms WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    // ── Time series ──

    pub fn create_time_series(&self, bucket_id: &str, name: &str, channels: &[String]) -> Result<String> {
        let id = new_id();
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO time_series (id, bucket_id, name, channels, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, bucket_id, name, serde_json::to_string(channels)?, now_string()],
            )?;
        }
        self.cache.invalidate(bucket_id);
        Ok(id)
    }

    /// Series of a bucket in creation order.
    pub fn list_time_series(&self, bucket_id: &str) -> Result<Vec<TimeSeries>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, bucket_id, name, channels, created_at FROM time_series \
             WHERE bucket_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![bucket_id], series_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_time_series(&self, id: &str) -> Result<TimeSeries> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, bucket_id, name, channels, created_at FROM time_series WHERE id = ?1",
            params![id],
            series_from_row,
        )
        .optional()?
        .ok_or_else(|| AnalysisError::not_found("time series", id))
    }

    pub fn rename_time_series(&self, id: &str, name: &str) -> Result<()> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE time_series SET name = ?2 WHERE id = ?1",
            params![id, name],
        )?;
        if count == 0 {
            return Err(AnalysisError::not_found("time series", id));
        }
        Ok(())
    }

    pub fn delete_time_series(&self, id: &str) -> Result<bool> {
        let ts = self.get_time_series(id)?;
        let count = {
            let conn = self.conn()?;
            conn.execute("DELETE FROM time_series WHERE id = ?1", params![id])?
        };
        self.cache.invalidate(&ts.bucket_id);
        Ok(count > 0)
    }

    /// Appends imported points. Values for channels outside the series'
    /// channel set are rejected.
    pub fn append_points(&self, ts_id: &str, points: &[DataPoint]) -> Result<usize> {
        let ts = self.get_time_series(ts_id)?;
        let known: HashSet<&str> = ts.channels.iter().map(String::as_str).collect();
        let mut inserted = 0;
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO time_series_data (ts_id, bucket_id, ts_ms, channel, value) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for point in points {
                    for (channel, value) in &point.values {
                        if !known.contains(channel.as_str()) {
                            return Err(AnalysisError::invalid(
                                "channel",
                                format!("'{channel}' is not a channel of series {ts_id}"),
                            ));
                        }
                        stmt.execute(params![
                            ts_id,
                            ts.bucket_id,
                            point.timestamp.timestamp_millis(),
                            channel,
                            value
                        ])?;
                        inserted += 1;
                    }
                }
            }
            tx.commit()?;
        }
        self.cache.invalidate(&ts.bucket_id);
        Ok(inserted)
    }

    /// All points of a series ordered by timestamp.
    pub fn points(&self, ts_id: &str) -> Result<Vec<DataPoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ts_ms, channel, value FROM time_series_data WHERE ts_id = ?1 ORDER BY ts_ms",
        )?;
        let mut grouped: BTreeMap<i64, BTreeMap<String, f64>> = BTreeMap::new();
        let rows = stmt.query_map(params![ts_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
        })?;
        for row in rows {
            let (ms, channel, value) = row?;
            grouped.entry(ms).or_default().insert(channel, value);
        }
        Ok(grouped
            .into_iter()
            .map(|(ms, values)| DataPoint {
                timestamp: from_millis(ms),
                values,
            })
            .collect())
    }

    /// `(timestamp, value)` pairs of one channel inside `window`.
    pub fn channel_points(
        &self,
        ts_id: &str,
        channel: &str,
        window: &TimeWindow,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let (from, to) = window.bounds_millis();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ts_ms, value FROM time_series_data \
             WHERE ts_id = ?1 AND channel = ?2 AND ts_ms >= ?3 AND ts_ms <= ?4 ORDER BY ts_ms",
        )?;
        let rows = stmt
            .query_map(params![ts_id, channel, from, to], |row| {
                Ok((from_millis(row.get(0)?), row.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_points(&self, ts_id: &str, channel: &str, window: &TimeWindow) -> Result<i64> {
        let (from, to) = window.bounds_millis();
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT count(*) FROM time_series_data \
             WHERE ts_id = ?1 AND channel = ?2 AND ts_ms >= ?3 AND ts_ms <= ?4",
            params![ts_id, channel, from, to],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Scores ──

    /// Replaces every score of `(ts_id, algorithm_id)` with `scores`.
    pub fn replace_scores(&self, ts_id: &str, algorithm_id: &str, scores: &[AnomalyScore]) -> Result<()> {
        let ts = self.get_time_series(ts_id)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM anomaly_scores WHERE ts_id = ?1 AND algorithm_id = ?2",
            params![ts_id, algorithm_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO anomaly_scores (ts_id, algorithm_id, bucket_id, channel, ts_ms, value) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for score in scores {
                stmt.execute(params![
                    ts_id,
                    algorithm_id,
                    ts.bucket_id,
                    score.channel,
                    score.timestamp.timestamp_millis(),
                    score.value
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn scores(
        &self,
        ts_id: &str,
        algorithm_id: &str,
        channel: &str,
        window: &TimeWindow,
    ) -> Result<Vec<AnomalyScore>> {
        let (from, to) = window.bounds_millis();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ts_ms, channel, value FROM anomaly_scores \
             WHERE ts_id = ?1 AND algorithm_id = ?2 AND channel = ?3 AND ts_ms >= ?4 AND ts_ms <= ?5 \
             ORDER BY ts_ms",
        )?;
        let rows = stmt
            .query_map(params![ts_id, algorithm_id, channel, from, to], |row| {
                Ok(AnomalyScore {
                    timestamp: from_millis(row.get(0)?),
                    channel: row.get(1)?,
                    value: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_scores(&self, ts_id: &str, algorithm_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT count(*) FROM anomaly_scores WHERE ts_id = ?1 AND algorithm_id = ?2",
            params![ts_id, algorithm_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Per-algorithm min/max of all scores in the bucket for `channel`.
    pub fn baselines(&self, bucket_id: &str, channel: &str) -> Result<HashMap<String, Baseline>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT algorithm_id, min(value), max(value) FROM anomaly_scores \
             WHERE bucket_id = ?1 AND channel = ?2 GROUP BY algorithm_id",
        )?;
        let rows = stmt
            .query_map(params![bucket_id, channel], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Baseline {
                        min: row.get(1)?,
                        max: row.get(2)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(rows)
    }

    /// Algorithms with at least one stored score for the series channel.
    pub fn scored_algorithms(&self, ts_id: &str, channel: &str) -> Result<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT algorithm_id FROM anomaly_scores WHERE ts_id = ?1 AND channel = ?2",
        )?;
        let rows = stmt
            .query_map(params![ts_id, channel], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(rows)
    }

    // ── Classifications ──

    /// Replaces the classifications of `(algorithm_id, channel)` for every
    /// series in `ts_ids` with `labels`.
    pub fn replace_classifications(
        &self,
        algorithm_id: &str,
        channel: &str,
        ts_ids: &[String],
        labels: &[AnomalyClassification],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for ts_id in ts_ids {
            tx.execute(
                "DELETE FROM anomaly_classifications WHERE algorithm_id = ?1 AND ts_id = ?2 AND channel = ?3",
                params![algorithm_id, ts_id, channel],
            )?;
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO anomaly_classifications (id, ts_id, algorithm_id, channel, date_trunc, granularity) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for label in labels {
                stmt.execute(params![
                    new_id(),
                    label.ts_id,
                    label.algorithm_id,
                    label.channel,
                    label.date_trunc,
                    label.granularity.as_str()
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn classifications(&self, ts_id: &str, channel: &str) -> Result<Vec<AnomalyClassification>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ts_id, algorithm_id, channel, date_trunc, granularity FROM anomaly_classifications \
             WHERE ts_id = ?1 AND channel = ?2 ORDER BY date_trunc, algorithm_id",
        )?;
        let rows = stmt
            .query_map(params![ts_id, channel], |row| {
                Ok(AnomalyClassification {
                    ts_id: row.get(0)?,
                    algorithm_id: row.get(1)?,
                    channel: row.get(2)?,
                    date_trunc: row.get(3)?,
                    granularity: parse_column(row, 4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Anomalies ──

    pub fn insert_anomalies(&self, bucket_id: &str, anomalies: &[NewAnomaly]) -> Result<usize> {
        if anomalies.is_empty() {
            return Ok(0);
        }
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO anomalies (id, ts_id, bucket_id, channel, start_ms, end_ms, length, score) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for a in anomalies {
                    stmt.execute(params![
                        new_id(),
                        a.ts_id,
                        a.bucket_id,
                        a.channel,
                        a.start.timestamp_millis(),
                        a.end.timestamp_millis(),
                        a.length,
                        a.score
                    ])?;
                }
            }
            tx.commit()?;
        }
        self.cache.invalidate(bucket_id);
        Ok(anomalies.len())
    }

    /// Adds a hand-marked anomaly. Reversed bounds are swapped; a zero-length
    /// range is ignored and yields `None`.
    pub fn add_manual_anomaly(&self, req: &ManualAnomalyRequest) -> Result<Option<String>> {
        let ts = self.get_time_series(&req.ts_id)?;
        let (start, end) = if req.start > req.end {
            (req.end, req.start)
        } else {
            (req.start, req.end)
        };
        if start == end {
            return Ok(None);
        }
        let length = self.count_points(&ts.id, &req.channel, &TimeWindow::between(start, end))?;
        let id = new_id();
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO anomalies (id, ts_id, bucket_id, channel, start_ms, end_ms, length, score, \
                 keep, bookmark, manual, rating, views) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1.0, 1, 0, 1, 2, 0)",
                params![
                    id,
                    ts.id,
                    ts.bucket_id,
                    req.channel,
                    start.timestamp_millis(),
                    end.timestamp_millis(),
                    length
                ],
            )?;
        }
        self.cache.invalidate(&ts.bucket_id);
        Ok(Some(id))
    }

    pub fn get_anomaly(&self, id: &str) -> Result<Anomaly> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE id = ?1"),
            params![id],
            anomaly_from_row,
        )
        .optional()?
        .ok_or_else(|| AnalysisError::not_found("anomaly", id))
    }

    pub fn list_anomalies(&self, filter: &AnomalyFilter) -> Result<Vec<Anomaly>> {
        let mut sql = format!("SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE 1 = 1");
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(bucket_id) = &filter.bucket_id {
            args.push(bucket_id);
            sql.push_str(&format!(" AND bucket_id = ?{}", args.len()));
        }
        if let Some(ts_id) = &filter.ts_id {
            args.push(ts_id);
            sql.push_str(&format!(" AND ts_id = ?{}", args.len()));
        }
        if filter.only_kept {
            sql.push_str(" AND keep = 1");
        }
        if filter.only_manual {
            sql.push_str(" AND manual = 1");
        }
        if filter.only_bookmarked {
            sql.push_str(" AND bookmark = 1");
        }
        sql.push_str(" ORDER BY start_ms, rowid");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args.as_slice(), anomaly_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update_anomaly(&self, id: &str, update: &UpdateAnomalyRequest) -> Result<()> {
        let anomaly = self.get_anomaly(id)?;
        {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE anomalies SET rating = ?2, keep = ?3, bookmark = ?4 WHERE id = ?1",
                params![
                    id,
                    update.rating.unwrap_or(anomaly.rating),
                    update.keep.unwrap_or(anomaly.keep),
                    update.bookmark.unwrap_or(anomaly.bookmark)
                ],
            )?;
        }
        self.cache.invalidate(&anomaly.bucket_id);
        Ok(())
    }

    pub fn increase_views(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE anomalies SET views = views + 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Clears the rating of every extracted anomaly of the bucket. Only
    /// bookmarked ones stay kept. Hand-marked anomalies are untouched.
    pub fn reset_ratings(&self, bucket_id: &str) -> Result<usize> {
        let count = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE anomalies SET rating = 0, keep = bookmark WHERE bucket_id = ?1 AND manual = 0",
                params![bucket_id],
            )?
        };
        self.cache.invalidate(bucket_id);
        Ok(count)
    }

    pub fn reset_views(&self, bucket_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute("UPDATE anomalies SET views = 0 WHERE bucket_id = ?1", params![bucket_id])?;
        Ok(count)
    }

    pub fn delete_anomaly(&self, id: &str) -> Result<()> {
        let anomaly = self.get_anomaly(id)?;
        {
            let conn = self.conn()?;
            conn.execute("DELETE FROM anomalies WHERE id = ?1", params![id])?;
        }
        self.cache.invalidate(&anomaly.bucket_id);
        Ok(())
    }

    /// Deletes the anomalies of a series. Kept anomalies survive unless
    /// `include_kept` is set.
    pub fn delete_anomalies(&self, ts_id: &str, include_kept: bool) -> Result<usize> {
        let ts = self.get_time_series(ts_id)?;
        let count = {
            let conn = self.conn()?;
            if include_kept {
                conn.execute("DELETE FROM anomalies WHERE ts_id = ?1", params![ts_id])?
            } else {
                conn.execute(
                    "DELETE FROM anomalies WHERE ts_id = ?1 AND keep = 0",
                    params![ts_id],
                )?
            }
        };
        self.cache.invalidate(&ts.bucket_id);
        Ok(count)
    }

    // ── Nominals ──

    /// Adds the nominal for `(ts_id, channel, date)` or removes it if present.
    pub fn toggle_nominal(
        &self,
        ts_id: &str,
        channel: &str,
        granularity: Granularity,
        date: Option<&str>,
    ) -> Result<NominalToggle> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM nominals WHERE ts_id = ?1 AND channel = ?2 AND date IS ?3",
                params![ts_id, channel, date],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute("DELETE FROM nominals WHERE id = ?1", params![id])?;
                Ok(NominalToggle::Removed)
            }
            None => {
                conn.execute(
                    "INSERT INTO nominals (id, ts_id, channel, granularity, date) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![new_id(), ts_id, channel, granularity.as_str(), date],
                )?;
                Ok(NominalToggle::Added)
            }
        }
    }

    pub fn list_nominals(&self, ts_id: &str, channel: Option<&str>) -> Result<Vec<Nominal>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, ts_id, channel, granularity, date FROM nominals \
             WHERE ts_id = ?1 AND (?2 IS NULL OR channel = ?2) ORDER BY date, rowid",
        )?;
        let rows = stmt
            .query_map(params![ts_id, channel], |row| {
                Ok(Nominal {
                    id: row.get(0)?,
                    ts_id: row.get(1)?,
                    channel: row.get(2)?,
                    granularity: parse_column(row, 3)?,
                    date: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
