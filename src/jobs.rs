//! Recurring background work: the interval scheduler and the housekeeping
//! jobs it runs (offer expiry, log compaction).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::SchedulingError;
use crate::registry::FacilityRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("unsupported schedule {0:?}, expected `@every <n>s|m|h`")]
    Unsupported(String),
    #[error("job {0:?} is already scheduled")]
    Duplicate(String),
    #[error("scheduler is shut down")]
    ShutDown,
}

/// A unit of recurring work. Runs of one job never overlap.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run(&self) -> Result<(), SchedulingError>;
}

/// Something that runs named jobs on a schedule.
pub trait JobScheduler: Send + Sync {
    fn add_job(&self, name: &str, schedule: &str, job: Arc<dyn ScheduledJob>) -> Result<(), ScheduleError>;
}

/// Parse `@every <n>s`, `@every <n>m` or `@every <n>h`.
pub fn parse_every(schedule: &str) -> Result<Duration, ScheduleError> {
    let unsupported = || ScheduleError::Unsupported(schedule.to_string());
    let spec = schedule
        .trim()
        .strip_prefix("@every")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(unsupported)?;
    let unit = spec.chars().last().ok_or_else(unsupported)?;
    let digits = &spec[..spec.len() - unit.len_utf8()];
    let n: u64 = digits.trim().parse().map_err(|_| unsupported())?;
    let secs = match unit {
        's' => Some(n),
        'm' => n.checked_mul(60),
        'h' => n.checked_mul(3600),
        _ => None,
    }
    .filter(|s| *s > 0)
    .ok_or_else(unsupported)?;
    Ok(Duration::from_secs(secs))
}

/// Runs each job on its own tokio task at a fixed period. The first run
/// happens one period after the job is added.
pub struct IntervalScheduler {
    tasks: DashMap<String, JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl IntervalScheduler {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            tasks: DashMap::new(),
            stop,
        }
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stop scheduling new runs and wait for in-flight runs to finish.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.tasks.remove(&name)
                && let Err(e) = handle.await
            {
                warn!(job = %name, "job task ended abnormally: {e}");
            }
        }
        info!("scheduler stopped");
    }
}

impl Default for IntervalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler for IntervalScheduler {
    fn add_job(&self, name: &str, schedule: &str, job: Arc<dyn ScheduledJob>) -> Result<(), ScheduleError> {
        let period = parse_every(schedule)?;
        if *self.stop.borrow() {
            return Err(ScheduleError::ShutDown);
        }
        match self.tasks.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ScheduleError::Duplicate(name.to_string())),
            Entry::Vacant(slot) => {
                let stop = self.stop.subscribe();
                slot.insert(tokio::spawn(run_every(name.to_string(), period, job, stop)));
                info!(job = name, ?period, "job scheduled");
                Ok(())
            }
        }
    }
}

async fn run_every(name: String, period: Duration, job: Arc<dyn ScheduledJob>, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }
        debug!(job = %name, "job run starting");
        if let Err(e) = job.run().await {
            warn!(job = %name, "job run failed: {e}");
            metrics::counter!(crate::observability::JOB_FAILURES_TOTAL, "job" => name.clone()).increment(1);
        }
    }
}

// ── Jobs ─────────────────────────────────────────────────

/// Expires waitlist offers past their deadline in every facility.
pub struct OfferSweepJob {
    engine: Arc<Engine>,
}

impl OfferSweepJob {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ScheduledJob for OfferSweepJob {
    async fn run(&self) -> Result<(), SchedulingError> {
        let now = self.engine.now();
        for facility_id in self.engine.registry().facility_ids() {
            match self.engine.expire_offers(facility_id, now).await {
                Ok(0) => {}
                Ok(n) => info!(facility_id, expired = n, "waitlist offers expired"),
                Err(e) => warn!(facility_id, "offer sweep failed: {e}"),
            }
        }
        Ok(())
    }
}

/// Rewrites a facility log as a snapshot once enough appends pile up.
pub struct CompactionJob {
    registry: Arc<FacilityRegistry>,
    threshold: u64,
}

impl CompactionJob {
    pub fn new(registry: Arc<FacilityRegistry>, threshold: u64) -> Self {
        Self { registry, threshold }
    }
}

#[async_trait]
impl ScheduledJob for CompactionJob {
    async fn run(&self) -> Result<(), SchedulingError> {
        for facility_id in self.registry.facility_ids() {
            let store = self.registry.get(facility_id)?;
            let appends = store.appends_since_compact().await;
            if appends < self.threshold {
                continue;
            }
            match store.compact().await {
                Ok(()) => info!(facility_id, appends, "facility log compacted"),
                Err(e) => tracing::error!(facility_id, "compaction failed: {e}"),
            }
        }
        Ok(())
    }
}
