//! Resource records shared by every reconcilable kind
//!
//! Every managed object (application, bucket, database, domain, trigger,
//! subscription, billing order) is persisted in the same shape: a desired state
//! written by the owner, an actual phase written by the executor, and a lock
//! timestamp that backs the lease protocol.

mod table;

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use table::*;

/// Kind tag selecting the transition table that drives a record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ResourceKind {
    Application,
    StorageUser,
    StorageBucket,
    Database,
    RuntimeDomain,
    BucketDomain,
    WebsiteHosting,
    CronTrigger,
    Subscription,
    SubscriptionRenewal,
    ChargeOrder,
}

impl ResourceKind {
    /// Every kind the engine schedules
    pub const ALL: [ResourceKind; 11] = [
        ResourceKind::Application,
        ResourceKind::StorageUser,
        ResourceKind::StorageBucket,
        ResourceKind::Database,
        ResourceKind::RuntimeDomain,
        ResourceKind::BucketDomain,
        ResourceKind::WebsiteHosting,
        ResourceKind::CronTrigger,
        ResourceKind::Subscription,
        ResourceKind::SubscriptionRenewal,
        ResourceKind::ChargeOrder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Application => "Application",
            ResourceKind::StorageUser => "StorageUser",
            ResourceKind::StorageBucket => "StorageBucket",
            ResourceKind::Database => "Database",
            ResourceKind::RuntimeDomain => "RuntimeDomain",
            ResourceKind::BucketDomain => "BucketDomain",
            ResourceKind::WebsiteHosting => "WebsiteHosting",
            ResourceKind::CronTrigger => "CronTrigger",
            ResourceKind::Subscription => "Subscription",
            ResourceKind::SubscriptionRenewal => "SubscriptionRenewal",
            ResourceKind::ChargeOrder => "ChargeOrder",
        }
    }

    /// Lowercase, dash-separated form used in driver URLs
    pub fn slug(&self) -> &'static str {
        match self {
            ResourceKind::Application => "application",
            ResourceKind::StorageUser => "storage-user",
            ResourceKind::StorageBucket => "storage-bucket",
            ResourceKind::Database => "database",
            ResourceKind::RuntimeDomain => "runtime-domain",
            ResourceKind::BucketDomain => "bucket-domain",
            ResourceKind::WebsiteHosting => "website-hosting",
            ResourceKind::CronTrigger => "cron-trigger",
            ResourceKind::Subscription => "subscription",
            ResourceKind::SubscriptionRenewal => "subscription-renewal",
            ResourceKind::ChargeOrder => "charge-order",
        }
    }

    /// Transition table for this kind
    pub fn table(&self) -> &'static TransitionTable {
        match self {
            ResourceKind::Application => &WORKLOAD,
            _ => &PROVISIONED,
        }
    }

    /// Retry budget when the configuration does not override it.
    ///
    /// Billing kinds talk to payment providers and give up sooner.
    pub fn default_max_attempts(&self, configured: u32) -> u32 {
        match self {
            ResourceKind::ChargeOrder | ResourceKind::SubscriptionRenewal => configured.min(5),
            _ => configured,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the owner wants the resource to be
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum DesiredState {
    Active,
    Running,
    Stopped,
    Deleted,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Active => "Active",
            DesiredState::Running => "Running",
            DesiredState::Stopped => "Stopped",
            DesiredState::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-known real-world provisioning status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    Creating,
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Deleting,
    Deleted,
    Failed,
}

impl Phase {
    /// Phases that only exist while an action is being carried out
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Phase::Creating | Phase::Starting | Phase::Stopping | Phase::Deleting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Creating => "Creating",
            Phase::Created => "Created",
            Phase::Starting => "Starting",
            Phase::Started => "Started",
            Phase::Stopping => "Stopping",
            Phase::Stopped => "Stopped",
            Phase::Deleting => "Deleting",
            Phase::Deleted => "Deleted",
            Phase::Failed => "Failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work a driver performs to move a record along one edge of its table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Provision,
    BeginStart,
    Start,
    BeginStop,
    Stop,
    BeginTeardown,
    Teardown,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Provision => "provision",
            Action::BeginStart => "begin-start",
            Action::Start => "start",
            Action::BeginStop => "begin-stop",
            Action::Stop => "stop",
            Action::BeginTeardown => "begin-teardown",
            Action::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability shared by every persisted form of a reconcilable resource.
///
/// The kind tag selects the transition table; everything the scheduler and the
/// executor need to decide on work is derived from the (desired, phase) pair.
pub trait Reconcilable {
    fn kind(&self) -> ResourceKind;
    fn desired_state(&self) -> DesiredState;
    fn phase(&self) -> Phase;
    fn locked_at(&self) -> Option<DateTime<Utc>>;
    fn attempts(&self) -> u32;

    fn table(&self) -> &'static TransitionTable {
        self.kind().table()
    }

    /// Failed by the engine and not yet re-requested by a desired-state write.
    ///
    /// A failing commit releases the lock outright; a retry from the failed
    /// phase keeps its backoff lock and is not parked.
    fn is_parked(&self) -> bool {
        self.phase() == self.table().failed && self.attempts() > 0 && self.locked_at().is_none()
    }

    /// The edge to take next, or `None` when there is nothing to do
    fn next_transition(&self) -> Option<&'static TransitionRule> {
        if self.is_parked() {
            return None;
        }
        self.table().lookup(self.desired_state(), self.phase())
    }

    /// Phase equals the terminal projection of the desired state
    fn is_converged(&self) -> bool {
        self.table().converged_phase(self.desired_state()) == Some(self.phase())
    }

    /// Whether the scheduler should consider this record at all
    fn needs_work(&self) -> bool {
        self.next_transition().is_some()
    }
}

/// Persisted reconciliation record
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub id: String,
    pub kind: ResourceKind,
    /// Join key shared with related records (the owning application id)
    pub owner_key: String,
    pub desired_state: DesiredState,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Consecutive retryable failures of the current transition
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// New record in the kind's initial (desired, phase) pair
    pub fn new(
        kind: ResourceKind,
        id: impl Into<String>,
        owner_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let (desired_state, phase) = kind.table().initial;
        Self {
            id: id.into(),
            kind,
            owner_key: owner_key.into(),
            desired_state,
            phase,
            locked_at: None,
            message: None,
            attempts: 0,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Read-only projection for observers
    pub fn status(&self) -> ResourceStatus {
        ResourceStatus {
            id: self.id.clone(),
            kind: self.kind,
            desired_state: self.desired_state,
            phase: self.phase,
            message: self.message.clone(),
            updated_at: self.updated_at,
        }
    }

    /// Apply an external desired-state write.
    ///
    /// Returns whether the record changed. Deleted is sticky: once requested it
    /// can only be re-requested, never withdrawn. Any accepted write starts the
    /// next transition with a fresh retry budget.
    pub fn change_desired_state(&mut self, desired: DesiredState, now: DateTime<Utc>) -> Result<bool> {
        if !self.table().supports(desired) {
            return Err(Error::validation(format!(
                "{} '{}' does not support desired state {}",
                self.kind, self.id, desired
            )));
        }
        if self.desired_state == DesiredState::Deleted && desired != DesiredState::Deleted {
            return Err(Error::validation(format!(
                "{} '{}' is being deleted and cannot become {}",
                self.kind, self.id, desired
            )));
        }
        if self.desired_state == desired {
            if !self.is_parked() {
                return Ok(false);
            }
            // re-requesting the same state re-arms a failed record
            self.attempts = 0;
            self.updated_at = now;
            return Ok(true);
        }
        self.desired_state = desired;
        self.attempts = 0;
        self.updated_at = now;
        Ok(true)
    }

    /// Apply an executor write. `updated_at` moves only when phase or message change.
    pub fn apply_update(&mut self, update: &RecordUpdate, now: DateTime<Utc>) {
        let mut touched = false;
        if let Some(phase) = update.phase {
            touched |= self.phase != phase;
            self.phase = phase;
        }
        if let Some(message) = &update.message {
            touched |= &self.message != message;
            self.message = message.clone();
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        self.locked_at = update.locked_at;
        if touched {
            self.updated_at = now;
        }
    }
}

impl Reconcilable for ResourceRecord {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn desired_state(&self) -> DesiredState {
        self.desired_state
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.locked_at
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Token-guarded write issued under a lease.
///
/// `None` fields are left untouched, except `locked_at` which always replaces
/// the current lock value (`None` clears it).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordUpdate {
    pub phase: Option<Phase>,
    pub message: Option<Option<String>>,
    pub attempts: Option<u32>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl RecordUpdate {
    /// Clear the lock and change nothing else
    pub fn release() -> Self {
        Self::default()
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(Some(message.into()));
        self
    }

    pub fn clear_message(mut self) -> Self {
        self.message = Some(None);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn locked_at(mut self, locked_at: DateTime<Utc>) -> Self {
        self.locked_at = Some(locked_at);
        self
    }
}

/// Observability projection of a record
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub id: String,
    pub kind: ResourceKind,
    pub desired_state: DesiredState,
    pub phase: Phase,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}
