use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::models::{AnalysisType, Parameters};

pub const CONFIG_PATH_ENV: &str = "ANOMALY_SCOUT_CONFIG";
pub const DATABASE_PATH_ENV: &str = "ANOMALY_SCOUT_DB";
const DEFAULT_CONFIG_PATH: &str = "anomaly_scout.toml";

/// Top-level config loaded from `anomaly_scout.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoutConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub anomaly_scores: AnomalyScoresConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Algorithms attached to every new bucket of the matching type.
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<AlgorithmTemplate>,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            anomaly_scores: AnomalyScoresConfig::default(),
            logging: LoggingConfig::default(),
            algorithms: default_algorithms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "./anomaly_scout.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Idle backoff between polls of an empty queue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

/// Defaults applied to newly created buckets.
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyScoresConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
}

impl Default for AnomalyScoresConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            smoothing_window: default_smoothing_window(),
        }
    }
}

fn default_threshold() -> f64 {
    0.5
}

fn default_smoothing_window() -> usize {
    11
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "anomaly_scout=info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlgorithmTemplate {
    /// Detector registry key, e.g. `EWMA`.
    pub key: String,
    pub name: String,
    #[serde(rename = "type")]
    pub algorithm_type: AnalysisType,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub parameters: Parameters,
}

fn default_algorithms() -> Vec<AlgorithmTemplate> {
    vec![
        AlgorithmTemplate {
            key: "EWMA".to_string(),
            name: "EWMA deviation".to_string(),
            algorithm_type: AnalysisType::Scoring,
            weight: Some(1.0),
            parameters: Parameters::new(),
        },
        AlgorithmTemplate {
            key: "NEAREST_NORMAL".to_string(),
            name: "Nearest normal".to_string(),
            algorithm_type: AnalysisType::Classification,
            weight: None,
            parameters: Parameters::new(),
        },
    ]
}

impl ScoutConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: ScoutConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Loads from `ANOMALY_SCOUT_CONFIG` (or `anomaly_scout.toml`) and applies
    /// the `ANOMALY_SCOUT_DB` override.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(path)?;
        if let Ok(db) = std::env::var(DATABASE_PATH_ENV) {
            config.database.path = db;
        }
        Ok(config)
    }
}
