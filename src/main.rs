use std::sync::Arc;
use std::time::Duration;

use mockable::DefaultClock;
use tracing::info;

use courtside::config::Config;
use courtside::enforcement::{EnforcementJob, InspectOnlyEvaluator};
use courtside::engine::{Engine, LogEmailSender};
use courtside::jobs::{CompactionJob, IntervalScheduler, JobScheduler, OfferSweepJob};
use courtside::registry::FacilityRegistry;

/// Per-facility share of an enforcement run.
const FACILITY_EVALUATION_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    courtside::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let registry = Arc::new(FacilityRegistry::open(&config.data_dir)?);
    let engine = Arc::new(
        Engine::new(registry.clone(), Arc::new(DefaultClock), Arc::new(LogEmailSender))
            .with_timeouts(config.timeouts)
            .with_from_address(config.from_address.clone()),
    );

    let scheduler = IntervalScheduler::new();
    scheduler.add_job(
        "open_play_enforcement",
        &config.enforcement_schedule,
        Arc::new(EnforcementJob::new(
            engine.clone(),
            Arc::new(InspectOnlyEvaluator::new(engine.clone())),
            config.enforcement_timeout,
            FACILITY_EVALUATION_TIMEOUT.min(config.enforcement_timeout),
        )),
    )?;
    scheduler.add_job(
        "offer_sweep",
        &format!("@every {}s", config.offer_sweep_interval.as_secs().max(1)),
        Arc::new(OfferSweepJob::new(engine.clone())),
    )?;
    scheduler.add_job(
        "compaction",
        "@every 30s",
        Arc::new(CompactionJob::new(registry.clone(), config.compact_threshold)),
    )?;

    info!("courtside started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  facilities: {}", registry.len());
    info!("  jobs: {}", scheduler.job_names().join(", "));
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop the scheduler on SIGTERM/ctrl-c, letting in-flight runs finish
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping jobs");
    scheduler.shutdown().await;
    for facility_id in registry.facility_ids() {
        if let Ok(store) = registry.get(facility_id)
            && let Err(e) = store.compact().await
        {
            tracing::warn!(facility_id, "final compaction failed: {e}");
        }
    }
    info!("courtside stopped");
    Ok(())
}
