use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use anomaly_scout::cache::AnalysisCache;
use anomaly_scout::config::ScoutConfig;
use anomaly_scout::detector::DetectorRegistry;
use anomaly_scout::models::AnalysisType;
use anomaly_scout::queue::JobQueue;
use anomaly_scout::scheduler::CalculationScheduler;
use anomaly_scout::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = ScoutConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    let cache = Arc::new(AnalysisCache::new());
    let store = Arc::new(Store::open(&config.database.path, cache)?);
    tracing::info!("store opened at {}", config.database.path);

    let registry = Arc::new(DetectorRegistry::with_builtin());
    tracing::info!(
        "detectors: scoring {:?}, classification {:?}",
        registry.keys(AnalysisType::Scoring),
        registry.keys(AnalysisType::Classification)
    );
    for template in &config.algorithms {
        if let Err(e) = registry.validate(&template.key, template.algorithm_type) {
            tracing::warn!("default algorithm '{}' is unusable: {e}", template.name);
        }
    }

    let queue = JobQueue::new();
    let scheduler = Arc::new(CalculationScheduler::new(
        store,
        queue,
        registry,
        config.scheduler.poll_interval(),
    ));

    let cancel = CancellationToken::new();
    let handle = scheduler.start(cancel.clone());

    tracing::info!("anomaly-scout running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    handle.await?;

    Ok(())
}
