//! Reconciliation scheduler
//!
//! One loop per kind per worker. Each cycle lists unlocked candidates, oldest
//! first, tries to claim each and executes the claimed ones with bounded
//! concurrency. Any number of workers may run the same loop against the same
//! store; the lease decides who gets each record.

use std::sync::Arc;

use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::controllers::Context;
use crate::error::Result;
use crate::lease::Acquire;
use crate::metrics;
use crate::reconcilers::{Disposition, ExecutionReport};
use crate::resource::ResourceKind;

/// Tally of one scheduler cycle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates: usize,
    pub claimed: usize,
    /// Claims denied because another worker held the lease
    pub contended: usize,
    pub advanced: usize,
    pub retried: usize,
    pub failed: usize,
    pub lease_lost: usize,
    pub errors: usize,
}

impl CycleReport {
    fn record(&mut self, report: &ExecutionReport) {
        self.claimed += 1;
        match report.disposition {
            Disposition::Advanced { .. } => self.advanced += 1,
            Disposition::Retrying { .. } => self.retried += 1,
            Disposition::Failed { .. } => self.failed += 1,
            Disposition::LeaseLost => self.lease_lost += 1,
            Disposition::Converged => {}
        }
    }

    /// Whether the cycle did nothing at all
    pub fn is_idle(&self) -> bool {
        self.candidates == 0
    }
}

enum Claim {
    Executed(ExecutionReport),
    Denied,
}

/// Scans and executes candidates of one kind
#[derive(Clone)]
pub struct ReconciliationScheduler {
    kind: ResourceKind,
    worker: String,
    context: Arc<Context>,
}

impl ReconciliationScheduler {
    pub fn new(kind: ResourceKind, worker: impl Into<String>, context: Arc<Context>) -> Self {
        Self {
            kind,
            worker: worker.into(),
            context,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Run one scan-claim-execute cycle.
    ///
    /// Fails only when the candidate list cannot be read; per-record errors
    /// are logged and counted in the report.
    #[instrument(skip(self), fields(kind = %self.kind, worker = %self.worker))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let kind = self.kind.as_str();
        let _timer = metrics::CYCLE_DURATION.with_label_values(&[kind]).start_timer();
        let config = &self.context.config;

        let candidates = self
            .context
            .store
            .list_candidates(
                self.kind,
                self.context.clock.now(),
                config.lease_duration(),
                config.batch_size,
            )
            .await?;
        metrics::CANDIDATES
            .with_label_values(&[kind])
            .set(candidates.len() as f64);

        let mut report = CycleReport {
            candidates: candidates.len(),
            ..CycleReport::default()
        };
        if candidates.is_empty() {
            return Ok(report);
        }
        debug!(candidates = candidates.len(), "Scanning candidates");

        let results: Vec<(String, Result<Claim>)> = stream::iter(candidates)
            .map(|record| async move {
                let result = self.claim_and_execute(&record.id).await;
                (record.id, result)
            })
            .buffer_unordered(config.max_concurrent_executions)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(Claim::Executed(execution)) => {
                    metrics::RECONCILIATIONS
                        .with_label_values(&[kind, execution.disposition.label()])
                        .inc();
                    report.record(&execution);
                }
                Ok(Claim::Denied) => {
                    metrics::LEASE_CONTENTION.with_label_values(&[kind]).inc();
                    report.contended += 1;
                }
                Err(e) => {
                    error!(id = %id, error = %e, "Reconciliation failed");
                    metrics::RECONCILIATION_ERRORS.with_label_values(&[kind]).inc();
                    report.errors += 1;
                }
            }
        }

        info!(
            candidates = report.candidates,
            claimed = report.claimed,
            contended = report.contended,
            advanced = report.advanced,
            retried = report.retried,
            failed = report.failed,
            lease_lost = report.lease_lost,
            errors = report.errors,
            "Cycle finished"
        );
        Ok(report)
    }

    async fn claim_and_execute(&self, id: &str) -> Result<Claim> {
        let lease_duration = self.context.config.lease_duration();
        match self.context.locks.try_acquire(id, lease_duration).await? {
            Acquire::Granted { lease, record } => {
                let execution = self.context.executor.execute(&lease, &record).await?;
                Ok(Claim::Executed(execution))
            }
            Acquire::Denied => Ok(Claim::Denied),
        }
    }

    /// Cycle every scan interval until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let _active = ActiveScheduler::enter();
        let mut interval = tokio::time::interval(self.context.config.scan_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(kind = %self.kind, worker = %self.worker, error = %e, "Cycle aborted");
                        metrics::RECONCILIATION_ERRORS
                            .with_label_values(&[self.kind.as_str()])
                            .inc();
                    }
                }
            }
        }
        info!(kind = %self.kind, worker = %self.worker, "Scheduler stopped");
    }
}

/// Counts a running loop in the readiness gauge until dropped
struct ActiveScheduler;

impl ActiveScheduler {
    fn enter() -> Self {
        metrics::ACTIVE_SCHEDULERS.inc();
        ActiveScheduler
    }
}

impl Drop for ActiveScheduler {
    fn drop(&mut self) {
        metrics::ACTIVE_SCHEDULERS.dec();
    }
}

/// Run the scheduler loop for `kind`
pub async fn run(
    kind: ResourceKind,
    worker: String,
    context: Arc<Context>,
    shutdown: CancellationToken,
) {
    info!(kind = %kind, worker = %worker, "Starting scheduler");
    ReconciliationScheduler::new(kind, worker, context)
        .run(shutdown)
        .await;
}
