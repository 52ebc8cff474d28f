//! Driver that accepts every action without touching anything

use async_trait::async_trait;
use tracing::debug;

use super::{Driver, Outcome};
use crate::resource::{Action, ResourceRecord};

/// Used for kinds that have no external system configured
#[derive(Clone, Debug)]
pub struct NoopDriver {
    name: String,
}

impl NoopDriver {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for NoopDriver {
    fn default() -> Self {
        Self::named("noop")
    }
}

#[async_trait]
impl Driver for NoopDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, record: &ResourceRecord, action: Action) -> Outcome {
        debug!(kind = %record.kind, id = %record.id, action = %action, "No driver configured, accepting action");
        Outcome::Success
    }
}
