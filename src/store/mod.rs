//! Shared record store
//!
//! The store is the only shared mutable state in the engine. Each mutating
//! operation is a single atomic step against one record: the lock claim is a
//! compare-and-set on `locked_at`, and every write made under a lease is
//! conditioned on the lease token.

mod kubernetes;
mod memory;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::lease::lock_is_free;
use crate::resource::{
    DesiredState, Reconcilable, RecordUpdate, ResourceKind, ResourceRecord, ResourceStatus,
};

/// Persistence contract used by the lock manager, executor, scheduler and cascades
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Create a record; fails with [`Error::Conflict`] if the id is taken
    async fn insert(&self, record: ResourceRecord) -> Result<ResourceRecord>;

    async fn get(&self, id: &str) -> Result<Option<ResourceRecord>>;

    /// Every record of one kind
    async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceRecord>>;

    /// Records of one kind sharing an owner key
    async fn list_owned(&self, kind: ResourceKind, owner_key: &str) -> Result<Vec<ResourceRecord>>;

    /// External desired-state write. Returns the record as stored afterwards.
    async fn set_desired_state(
        &self,
        id: &str,
        desired: DesiredState,
        now: DateTime<Utc>,
    ) -> Result<ResourceRecord>;

    /// Atomically set `locked_at = now` if the current lock is free.
    ///
    /// Returns the locked record, or `None` when another lease is still valid.
    async fn compare_and_lock(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<ResourceRecord>>;

    /// Apply `update` only if `locked_at` still equals `token`.
    async fn commit(
        &self,
        id: &str,
        token: DateTime<Utc>,
        update: RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Unlocked records of `kind` that still have work to do, oldest first
    async fn list_candidates(
        &self,
        kind: ResourceKind,
        now: DateTime<Utc>,
        lease_duration: Duration,
        limit: usize,
    ) -> Result<Vec<ResourceRecord>> {
        let records = self.list(kind).await?;
        Ok(select_candidates(records, now, lease_duration, limit))
    }

    /// Read-only status projection
    async fn status(&self, id: &str) -> Result<ResourceStatus> {
        self.get(id)
            .await?
            .map(|r| r.status())
            .ok_or_else(|| Error::not_found(id))
    }
}

/// Filter and order scheduling candidates.
///
/// Oldest `updated_at` first so a record that keeps losing the race for a batch
/// slot moves to the front as newer work arrives.
pub fn select_candidates(
    records: Vec<ResourceRecord>,
    now: DateTime<Utc>,
    lease_duration: Duration,
    limit: usize,
) -> Vec<ResourceRecord> {
    let mut candidates: Vec<ResourceRecord> = records
        .into_iter()
        .filter(|r| r.needs_work() && lock_is_free(r.locked_at, now, lease_duration))
        .collect();
    candidates.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
    candidates.truncate(limit);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Phase;

    #[test]
    fn candidates_skip_converged_locked_and_failed_records() {
        let now = Utc::now();
        let lease = Duration::seconds(60);
        let old = now - Duration::minutes(10);

        let fresh = ResourceRecord::new(ResourceKind::Database, "fresh", "app", now);
        let oldest = ResourceRecord::new(ResourceKind::Database, "oldest", "app", old);

        let mut converged = ResourceRecord::new(ResourceKind::Database, "done", "app", old);
        converged.phase = Phase::Created;

        let mut locked = ResourceRecord::new(ResourceKind::Database, "locked", "app", old);
        locked.locked_at = Some(now);

        let mut failed = ResourceRecord::new(ResourceKind::Database, "failed", "app", old);
        failed.phase = Phase::Failed;

        let mut parked = ResourceRecord::new(ResourceKind::Database, "parked", "app", old);
        parked.desired_state = DesiredState::Deleted;
        parked.phase = Phase::Failed;
        parked.attempts = 1;

        let mut stale = ResourceRecord::new(ResourceKind::Database, "stale", "app", old);
        stale.locked_at = Some(now - lease);

        let picked = select_candidates(
            vec![fresh, converged, locked, failed, parked, stale, oldest],
            now,
            lease,
            10,
        );
        let ids: Vec<&str> = picked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["oldest", "stale", "fresh"]);
    }

    #[test]
    fn candidates_respect_the_batch_limit() {
        let now = Utc::now();
        let records = (0..5)
            .map(|i| {
                ResourceRecord::new(
                    ResourceKind::CronTrigger,
                    format!("t-{i}"),
                    "app",
                    now - Duration::seconds(i),
                )
            })
            .collect();
        let picked = select_candidates(records, now, Duration::seconds(60), 2);
        let ids: Vec<&str> = picked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["t-4", "t-3"]);
    }
}
