//! Open-play enforcement: a periodic pass that hands each facility with
//! upcoming sessions to an external evaluator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::SchedulingError;
use crate::jobs::ScheduledJob;
use crate::model::{Id, Ms};

/// What an evaluator did for one facility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub sessions_evaluated: usize,
    pub sessions_scaled: usize,
    pub sessions_cancelled: usize,
}

impl EvaluationSummary {
    fn absorb(&mut self, other: EvaluationSummary) {
        self.sessions_evaluated += other.sessions_evaluated;
        self.sessions_scaled += other.sessions_scaled;
        self.sessions_cancelled += other.sessions_cancelled;
    }
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    #[error("evaluator failed: {0}")]
    Evaluator(String),
}

/// Decides what happens to sessions nearing their cancellation cutoff.
/// Implementations act through the engine's open-play operations.
#[async_trait]
pub trait OpenPlayEvaluator: Send + Sync {
    async fn evaluate_sessions_approaching_cutoff(
        &self,
        facility_id: Id,
        now: Ms,
    ) -> Result<EvaluationSummary, EvaluationError>;
}

/// Reports sessions past their cutoff without changing them.
pub struct InspectOnlyEvaluator {
    engine: Arc<Engine>,
}

impl InspectOnlyEvaluator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl OpenPlayEvaluator for InspectOnlyEvaluator {
    async fn evaluate_sessions_approaching_cutoff(
        &self,
        facility_id: Id,
        now: Ms,
    ) -> Result<EvaluationSummary, EvaluationError> {
        let due = self.engine.sessions_approaching_cutoff(facility_id, now).await?;
        for session in &due {
            info!(
                facility_id,
                session_id = session.id,
                courts = session.current_court_count,
                "open play session past its cutoff"
            );
        }
        Ok(EvaluationSummary {
            sessions_evaluated: due.len(),
            ..EvaluationSummary::default()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnforcementReport {
    pub facilities: usize,
    pub succeeded: usize,
    /// Facility id and what went wrong.
    pub failures: Vec<(Id, String)>,
    pub summary: EvaluationSummary,
    /// The run deadline elapsed before every facility was visited.
    pub timed_out: bool,
}

pub struct EnforcementJob {
    engine: Arc<Engine>,
    evaluator: Arc<dyn OpenPlayEvaluator>,
    run_timeout: Duration,
    facility_timeout: Duration,
}

impl EnforcementJob {
    pub fn new(
        engine: Arc<Engine>,
        evaluator: Arc<dyn OpenPlayEvaluator>,
        run_timeout: Duration,
        facility_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            evaluator,
            run_timeout,
            facility_timeout,
        }
    }

    /// One pass over every facility with upcoming sessions. A failing or
    /// slow facility is logged, counted and skipped.
    pub async fn run_once(&self, now: Ms) -> EnforcementReport {
        let started = Instant::now();
        metrics::counter!(crate::observability::ENFORCEMENT_RUNS_TOTAL).increment(1);

        let mut report = EnforcementReport::default();
        if tokio::time::timeout(self.run_timeout, self.evaluate_all(now, &mut report))
            .await
            .is_err()
        {
            warn!(
                visited = report.succeeded + report.failures.len(),
                facilities = report.facilities,
                "enforcement run hit its deadline"
            );
            report.timed_out = true;
        }

        metrics::histogram!(crate::observability::ENFORCEMENT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!(
            facilities = report.facilities,
            failed = report.failures.len(),
            evaluated = report.summary.sessions_evaluated,
            "enforcement run finished"
        );
        report
    }

    async fn evaluate_all(&self, now: Ms, report: &mut EnforcementReport) {
        let listed = self.engine.facilities_with_upcoming_sessions(now).await;
        report.facilities = listed.len();
        if listed.is_empty() {
            debug!("no facilities with upcoming open play");
        }

        for entry in listed {
            let facility_id = match entry {
                Ok(facility_id) => facility_id,
                Err((facility_id, e)) => {
                    self.record_failure(report, facility_id, format!("listing sessions: {e}"));
                    continue;
                }
            };
            let outcome = tokio::time::timeout(
                self.facility_timeout,
                self.evaluator.evaluate_sessions_approaching_cutoff(facility_id, now),
            )
            .await;
            match outcome {
                Ok(Ok(summary)) => {
                    report.succeeded += 1;
                    report.summary.absorb(summary);
                }
                Ok(Err(e)) => self.record_failure(report, facility_id, e.to_string()),
                Err(_) => self.record_failure(report, facility_id, "evaluation timed out".to_string()),
            }
        }
    }

    fn record_failure(&self, report: &mut EnforcementReport, facility_id: Id, failure: String) {
        warn!(facility_id, "open play enforcement failed: {failure}");
        metrics::counter!(crate::observability::ENFORCEMENT_FACILITY_FAILURES_TOTAL).increment(1);
        report.failures.push((facility_id, failure));
    }
}

#[async_trait]
impl ScheduledJob for EnforcementJob {
    async fn run(&self) -> Result<(), SchedulingError> {
        self.run_once(self.engine.now()).await;
        Ok(())
    }
}
