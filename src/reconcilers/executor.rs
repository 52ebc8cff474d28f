//! Transition executor
//!
//! Given a record held under a lease, look up the single edge for its
//! (desired state, phase) pair, run the edge's action through the kind's
//! driver and commit the result under the lease token. One call performs at
//! most one transition; the scheduler drives records forward one edge per
//! claim.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{DriverRegistry, Outcome};
use crate::error::Result;
use crate::lease::{Lease, LockManager};
use crate::metrics;
use crate::reconcilers::cascade::ChangeEvent;
use crate::reconcilers::retry::{Decision, RetryController};
use crate::resource::{Action, Phase, Reconcilable, RecordUpdate, ResourceKind, ResourceRecord};

/// How one execution ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// No edge applies; the lease was released without a driver call
    Converged,
    /// The driver succeeded and the record moved to `to`
    Advanced { to: Phase },
    /// Transient failure; the record stays put until `delay` has passed
    Retrying { attempt: u32, delay: Duration },
    /// The record moved to the kind's failed phase
    Failed { reason: String },
    /// The lease was reclaimed before the result could be written
    LeaseLost,
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Converged => "converged",
            Disposition::Advanced { .. } => "advanced",
            Disposition::Retrying { .. } => "retrying",
            Disposition::Failed { .. } => "failed",
            Disposition::LeaseLost => "lease_lost",
        }
    }
}

/// Summary of one [`TransitionExecutor::execute`] call
#[derive(Clone, Debug)]
pub struct ExecutionReport {
    pub id: String,
    pub kind: ResourceKind,
    pub from: Phase,
    pub action: Option<Action>,
    pub disposition: Disposition,
}

/// Runs one transition per call for records the caller has leased
#[derive(Clone)]
pub struct TransitionExecutor {
    locks: LockManager,
    drivers: DriverRegistry,
    retry: RetryController,
    driver_timeout: Duration,
    events: Option<mpsc::Sender<ChangeEvent>>,
}

impl TransitionExecutor {
    pub fn new(
        locks: LockManager,
        drivers: DriverRegistry,
        retry: RetryController,
        driver_timeout: Duration,
    ) -> Self {
        Self {
            locks,
            drivers,
            retry,
            driver_timeout,
            events: None,
        }
    }

    /// Publish a [`ChangeEvent`] after every committed phase change
    pub fn with_events(mut self, events: mpsc::Sender<ChangeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Execute the next transition of `record`, which must be the snapshot
    /// returned when `lease` was granted.
    ///
    /// Driver failures are folded into the disposition. Only store errors are
    /// returned as `Err`, in which case the lease simply runs out.
    #[instrument(skip_all, fields(kind = %record.kind, id = %record.id))]
    pub async fn execute(&self, lease: &Lease, record: &ResourceRecord) -> Result<ExecutionReport> {
        let _timer = metrics::RECONCILE_DURATION
            .with_label_values(&[record.kind.as_str()])
            .start_timer();

        let report = |action, disposition| ExecutionReport {
            id: record.id.clone(),
            kind: record.kind,
            from: record.phase,
            action,
            disposition,
        };

        let Some(rule) = record.next_transition() else {
            debug!(phase = %record.phase, desired = %record.desired_state, "Nothing to do");
            let disposition = if self.locks.release(lease).await? {
                Disposition::Converged
            } else {
                Disposition::LeaseLost
            };
            return Ok(report(None, disposition));
        };

        let outcome = self.call_driver(record, rule.action).await;
        let decision = self.retry.decide(record.kind, record.attempts, outcome);

        let (update, disposition) = match decision {
            Decision::Advance => (
                RecordUpdate::release()
                    .phase(rule.to)
                    .clear_message()
                    .attempts(0),
                Disposition::Advanced { to: rule.to },
            ),
            Decision::Retry {
                attempt,
                delay,
                reason,
            } => (
                RecordUpdate::release()
                    .message(reason)
                    .attempts(attempt)
                    .locked_at(self.locks.retry_lock(lease, delay)),
                Disposition::Retrying { attempt, delay },
            ),
            Decision::Fail { attempt, reason } => (
                RecordUpdate::release()
                    .phase(record.table().failed)
                    .message(reason.clone())
                    .attempts(attempt),
                Disposition::Failed { reason },
            ),
        };

        if !self.locks.commit(lease, update).await? {
            warn!(action = %rule.action, "Lease expired during execution, result discarded");
            return Ok(report(Some(rule.action), Disposition::LeaseLost));
        }

        match &disposition {
            Disposition::Advanced { to } => {
                info!(action = %rule.action, from = %record.phase, to = %to, "Transition committed");
            }
            Disposition::Retrying { attempt, delay } => {
                info!(action = %rule.action, attempt, delay_ms = delay.as_millis() as u64, "Transition will be retried");
            }
            Disposition::Failed { reason } => {
                warn!(action = %rule.action, reason = %reason, "Transition failed");
            }
            Disposition::Converged | Disposition::LeaseLost => {}
        }

        let to = match &disposition {
            Disposition::Advanced { to } => Some(*to),
            Disposition::Failed { .. } => Some(record.table().failed),
            _ => None,
        };
        if let Some(to) = to.filter(|to| *to != record.phase) {
            self.publish(ChangeEvent {
                id: record.id.clone(),
                kind: record.kind,
                owner_key: record.owner_key.clone(),
                desired_state: record.desired_state,
                phase: to,
            });
        }

        Ok(report(Some(rule.action), disposition))
    }

    async fn call_driver(&self, record: &ResourceRecord, action: Action) -> Outcome {
        let kind = record.kind.as_str();
        let outcome = match self.drivers.get(record.kind) {
            None => Outcome::fatal(format!("no driver registered for {}", record.kind)),
            Some(driver) => {
                let _timer = metrics::DRIVER_DURATION
                    .with_label_values(&[kind, action.as_str()])
                    .start_timer();
                debug!(driver = driver.name(), action = %action, "Calling driver");
                match tokio::time::timeout(self.driver_timeout, driver.apply(record, action)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Outcome::retryable(format!(
                        "{action} did not complete within {}s",
                        self.driver_timeout.as_secs_f64()
                    )),
                }
            }
        };
        metrics::DRIVER_CALLS
            .with_label_values(&[kind, action.as_str(), outcome.label()])
            .inc();
        outcome
    }

    fn publish(&self, event: ChangeEvent) {
        let Some(events) = &self.events else {
            return;
        };
        // the periodic cascade sweep covers anything dropped here
        if let Err(e) = events.try_send(event) {
            debug!(error = %e, "Change event not delivered");
        }
    }
}
