//! Driver adapters: the boundary to the systems that do the real provisioning
//!
//! The engine never looks inside a driver. It hands over a record and an
//! action and interprets the three-way [`Outcome`].

mod noop;
mod webhook;

pub use noop::*;
pub use webhook::*;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::resource::{Action, ResourceKind, ResourceRecord};

/// Result of one driver call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The action took effect; the record may move to the next phase
    Success,
    /// Transient failure (unreachable backend, rate limit, timeout)
    Retryable(String),
    /// Permanent rejection; retrying cannot help
    Fatal(String),
}

impl Outcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Outcome::Retryable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Outcome::Fatal(reason.into())
    }

    /// Label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Retryable(_) => "retryable",
            Outcome::Fatal(_) => "fatal",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Retryable(reason) => write!(f, "retryable: {reason}"),
            Outcome::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

/// Provisioning driver for one or more resource kinds.
///
/// Implementations must be idempotent: the same action may be applied again
/// after a worker crash, and re-applying an action whose effect is already in
/// place must leave the external system unchanged and report success.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    async fn apply(&self, record: &ResourceRecord, action: Action) -> Outcome;
}

/// Kind → driver lookup
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<ResourceKind, Arc<dyn Driver>>,
    fallback: Option<Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` for `kind`, replacing any previous registration
    pub fn register(mut self, kind: ResourceKind, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(kind, driver);
        self
    }

    /// Driver used for kinds without their own registration
    pub fn with_fallback(mut self, driver: Arc<dyn Driver>) -> Self {
        self.fallback = Some(driver);
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Option<Arc<dyn Driver>> {
        self.drivers
            .get(&kind)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.drivers.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("DriverRegistry")
            .field("kinds", &kinds)
            .field("fallback", &self.fallback.as_ref().map(|d| d.name().to_string()))
            .finish()
    }
}
