//! Periodic recovery of runs orphaned by a crashed process.
//!
//! Every tick asks the run store for non-terminal runs older than the
//! staleness threshold and hands each one to
//! [`AgentOrchestrator::recover_run`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::orchestrator::{AgentOrchestrator, Recovery};

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub redriven: usize,
    pub failed: usize,
    pub untouched: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RecoverySweep {
    orchestrator: Arc<AgentOrchestrator>,
    interval: Duration,
    stale_after: Duration,
}

impl RecoverySweep {
    /// Sweep on the orchestrator's configured interval and threshold.
    pub fn new(orchestrator: Arc<AgentOrchestrator>) -> Self {
        let config = orchestrator.config();
        let interval = config.recovery_sweep_interval;
        let stale_after = config.stale_run_after;
        Self {
            orchestrator,
            interval,
            stale_after,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sweep until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "Recovery sweep started",
        );

        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Recovery sweep stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.is_empty() => {
                            tracing::debug!("Recovery sweep: no stale runs");
                        }
                        Ok(report) => {
                            tracing::info!(
                                redriven = report.redriven,
                                failed = report.failed,
                                untouched = report.untouched,
                                errors = report.errors,
                                "Recovery sweep: handled stale runs",
                            );
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Recovery sweep failed");
                        }
                    }
                }
            }
        }
    }

    /// One pass over the stale runs. Each run is recovered on its own task
    /// so a slow collaborator on one run does not hold up the rest. A
    /// failure on one run is logged and counted.
    pub async fn sweep_once(&self) -> Result<SweepReport, OrchestratorError> {
        let older_than_ms = i64::try_from(self.stale_after.as_millis()).unwrap_or(i64::MAX);
        let stale = self
            .orchestrator
            .stores()
            .runs
            .find_stale_runs(older_than_ms)
            .await?;

        let mut tasks = JoinSet::new();
        for run in stale {
            let orchestrator = Arc::clone(&self.orchestrator);
            tasks.spawn(async move {
                let outcome = orchestrator.recover_run(&run).await;
                (run.id, outcome)
            });
        }

        let mut report = SweepReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Recovery::Redriven))) => report.redriven += 1,
                Ok((_, Ok(Recovery::Failed))) => report.failed += 1,
                Ok((_, Ok(Recovery::Untouched))) => report.untouched += 1,
                Ok((run_id, Err(e))) => {
                    report.errors += 1;
                    tracing::error!(run_id = %run_id, error = %e, "Failed to recover stale run");
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(error = %e, "Stale run recovery task failed");
                }
            }
        }
        Ok(report)
    }
}
