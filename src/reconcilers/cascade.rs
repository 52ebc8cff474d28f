//! Cascade notifier
//!
//! Ownership is expressed as data: each [`CascadeRule`] says which owned kinds
//! follow a parent kind, and to which desired state, once the parent meets a
//! trigger. Owned records are found by `owner_key`. Propagation only writes
//! desired states; every child then converges on its own transition table
//! through the ordinary scheduler loop.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::metrics;
use crate::resource::{DesiredState, Phase, ResourceKind, ResourceRecord};
use crate::store::ResourceStore;

/// Published by the executor after a committed phase change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub id: String,
    pub kind: ResourceKind,
    pub owner_key: String,
    pub desired_state: DesiredState,
    pub phase: Phase,
}

/// Parent condition that fires a rule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeTrigger {
    /// The parent's desired state equals this value
    DesiredState(DesiredState),
    /// The parent's `expires_at` is at or before now
    Expired,
}

impl CascadeTrigger {
    pub fn fires(&self, parent: &ResourceRecord, now: DateTime<Utc>) -> bool {
        match self {
            CascadeTrigger::DesiredState(state) => parent.desired_state == *state,
            CascadeTrigger::Expired => parent.expires_at.is_some_and(|at| at <= now),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CascadeRule {
    pub parent: ResourceKind,
    pub children: &'static [ResourceKind],
    pub trigger: CascadeTrigger,
    pub child_state: DesiredState,
}

/// Subscription rules come first so one sweep can carry a subscription
/// deletion all the way down to the application's resources.
static DEFAULT_RULES: &[CascadeRule] = &[
    CascadeRule {
        parent: ResourceKind::Subscription,
        children: &[ResourceKind::Application],
        trigger: CascadeTrigger::DesiredState(DesiredState::Deleted),
        child_state: DesiredState::Deleted,
    },
    CascadeRule {
        parent: ResourceKind::Subscription,
        children: &[ResourceKind::Application],
        trigger: CascadeTrigger::Expired,
        child_state: DesiredState::Stopped,
    },
    CascadeRule {
        parent: ResourceKind::Application,
        children: &[
            ResourceKind::StorageUser,
            ResourceKind::StorageBucket,
            ResourceKind::Database,
            ResourceKind::RuntimeDomain,
            ResourceKind::BucketDomain,
            ResourceKind::WebsiteHosting,
            ResourceKind::CronTrigger,
        ],
        trigger: CascadeTrigger::DesiredState(DesiredState::Deleted),
        child_state: DesiredState::Deleted,
    },
];

pub fn default_rules() -> &'static [CascadeRule] {
    DEFAULT_RULES
}

/// Counts from one propagation or sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Parents whose rules were evaluated
    pub parents: usize,
    /// Desired-state writes made
    pub writes: usize,
    /// Children already in the target state, or deleted
    pub skipped: usize,
    /// Writes that failed with a store error
    pub errors: usize,
}

impl CascadeReport {
    fn merge(&mut self, other: CascadeReport) {
        self.parents += other.parents;
        self.writes += other.writes;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// Writes owned records' desired states when their parent's state demands it
#[derive(Clone)]
pub struct CascadeNotifier {
    store: Arc<dyn ResourceStore>,
    clock: Arc<dyn Clock>,
    rules: &'static [CascadeRule],
    subscription_grace: Duration,
}

impl CascadeNotifier {
    pub fn new(store: Arc<dyn ResourceStore>, clock: Arc<dyn Clock>, subscription_grace: Duration) -> Self {
        Self {
            store,
            clock,
            rules: default_rules(),
            subscription_grace,
        }
    }

    pub fn with_rules(mut self, rules: &'static [CascadeRule]) -> Self {
        self.rules = rules;
        self
    }

    /// Re-read the record behind `event` and propagate from it
    pub async fn handle(&self, event: &ChangeEvent) -> Result<CascadeReport> {
        match self.store.get(&event.id).await? {
            Some(parent) => self.propagate(&parent).await,
            None => {
                debug!(id = %event.id, "Changed record no longer exists");
                Ok(CascadeReport::default())
            }
        }
    }

    /// Apply every rule whose parent is `parent`'s kind
    pub async fn propagate(&self, parent: &ResourceRecord) -> Result<CascadeReport> {
        let now = self.clock.now();
        let mut report = CascadeReport {
            parents: 1,
            ..CascadeReport::default()
        };

        let mut parent = parent.clone();
        if self.grace_elapsed(&parent, now) {
            report.merge(self.delete_lapsed(&parent, now).await?);
            parent.desired_state = DesiredState::Deleted;
        }

        for rule in self.rules.iter().filter(|r| r.parent == parent.kind) {
            if rule.trigger.fires(&parent, now) {
                report.merge(self.apply_rule(rule, &parent, now).await?);
            }
        }
        Ok(report)
    }

    /// Evaluate every rule against every parent in the store
    pub async fn sweep(&self) -> Result<CascadeReport> {
        let mut report = CascadeReport::default();

        let now = self.clock.now();
        for subscription in self.store.list(ResourceKind::Subscription).await? {
            if self.grace_elapsed(&subscription, now) {
                report.merge(self.delete_lapsed(&subscription, now).await?);
            }
        }

        for rule in self.rules {
            let now = self.clock.now();
            for parent in self.store.list(rule.parent).await? {
                if rule.trigger.fires(&parent, now) {
                    report.parents += 1;
                    report.merge(self.apply_rule(rule, &parent, now).await?);
                }
            }
        }

        if report.writes > 0 {
            info!(
                writes = report.writes,
                skipped = report.skipped,
                errors = report.errors,
                "Cascade sweep propagated desired states"
            );
        }
        Ok(report)
    }

    fn grace_elapsed(&self, record: &ResourceRecord, now: DateTime<Utc>) -> bool {
        record.kind == ResourceKind::Subscription
            && record.desired_state != DesiredState::Deleted
            && record
                .expires_at
                .and_then(|at| at.checked_add_signed(self.subscription_grace))
                .is_some_and(|deadline| deadline <= now)
    }

    async fn delete_lapsed(&self, subscription: &ResourceRecord, now: DateTime<Utc>) -> Result<CascadeReport> {
        info!(id = %subscription.id, owner = %subscription.owner_key, "Subscription grace period over, deleting");
        let mut report = CascadeReport::default();
        self.write(subscription, subscription, DesiredState::Deleted, now, &mut report)
            .await?;
        Ok(report)
    }

    async fn apply_rule(
        &self,
        rule: &CascadeRule,
        parent: &ResourceRecord,
        now: DateTime<Utc>,
    ) -> Result<CascadeReport> {
        let mut report = CascadeReport::default();
        for kind in rule.children {
            for child in self.store.list_owned(*kind, &parent.owner_key).await? {
                self.write(parent, &child, rule.child_state, now, &mut report)
                    .await?;
            }
        }
        Ok(report)
    }

    async fn write(
        &self,
        parent: &ResourceRecord,
        child: &ResourceRecord,
        target: DesiredState,
        now: DateTime<Utc>,
        report: &mut CascadeReport,
    ) -> Result<()> {
        if child.desired_state == target || child.desired_state == DesiredState::Deleted {
            report.skipped += 1;
            return Ok(());
        }
        match self.store.set_desired_state(&child.id, target, now).await {
            Ok(_) => {
                debug!(parent = %parent.id, child = %child.id, kind = %child.kind, state = %target, "Cascaded desired state");
                metrics::CASCADE_WRITES
                    .with_label_values(&[parent.kind.as_str(), child.kind.as_str(), target.as_str()])
                    .inc();
                report.writes += 1;
            }
            // lost a race with another writer; the next pass re-reads
            Err(Error::Validation(reason)) | Err(Error::NotFound(reason)) => {
                debug!(child = %child.id, reason = %reason, "Cascade write skipped");
                report.skipped += 1;
            }
            Err(e) => {
                warn!(parent = %parent.id, child = %child.id, error = %e, "Cascade write failed");
                report.errors += 1;
            }
        }
        Ok(())
    }
}
