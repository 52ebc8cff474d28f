//! Leases: time-bounded exclusive claims on one resource record
//!
//! A lease is granted by an atomic compare-and-set on the record's `locked_at`
//! and identified by the timestamp it wrote. Every later write made under the
//! lease is conditioned on `locked_at` still holding that token, so a worker
//! whose lease expired and was reclaimed can never overwrite the new owner's
//! work; its writes are silently dropped.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::resource::{RecordUpdate, ResourceRecord};
use crate::store::ResourceStore;

/// Whether a lock taken at `locked_at` no longer excludes anyone at `now`.
///
/// A lease taken at T is claimable again at exactly T + `lease_duration`.
pub fn lock_is_free(
    locked_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lease_duration: Duration,
) -> bool {
    match locked_at {
        None => true,
        Some(at) => at
            .checked_add_signed(lease_duration)
            .is_some_and(|expiry| now >= expiry),
    }
}

/// Proof of exclusive ownership of one record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    record_id: String,
    token: DateTime<Utc>,
    duration: Duration,
}

impl Lease {
    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    /// The `locked_at` value this lease wrote
    pub fn token(&self) -> DateTime<Utc> {
        self.token
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.token
            .checked_add_signed(self.duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    /// Lock value that makes the record claimable exactly `delay` after `now`
    pub fn lock_for_retry_after(&self, now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
        now.checked_add_signed(delay)
            .and_then(|at| at.checked_sub_signed(self.duration))
            .unwrap_or(now)
    }
}

/// Result of a claim attempt
#[derive(Clone, Debug)]
pub enum Acquire {
    /// The caller owns the record until the lease expires or is released
    Granted {
        lease: Lease,
        record: ResourceRecord,
    },
    /// Another worker holds a valid lease
    Denied,
}

/// Grants and releases leases against the shared store
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn ResourceStore>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(store: Arc<dyn ResourceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Claim `record_id` for `lease_duration`. Never blocks.
    pub async fn try_acquire(&self, record_id: &str, lease_duration: Duration) -> Result<Acquire> {
        if lease_duration <= Duration::zero() {
            return Err(Error::validation("lease duration must be positive"));
        }
        let now = self.clock.now();
        match self
            .store
            .compare_and_lock(record_id, now, lease_duration)
            .await?
        {
            Some(record) => Ok(Acquire::Granted {
                lease: Lease {
                    record_id: record_id.to_string(),
                    token: now,
                    duration: lease_duration,
                },
                record,
            }),
            None => {
                debug!(id = %record_id, "Lease held by another worker");
                Ok(Acquire::Denied)
            }
        }
    }

    /// Apply `update` if the lease is still the current one.
    ///
    /// Returns `false` when the lease had already been reclaimed; that is not an
    /// error, the write is simply dropped.
    pub async fn commit(&self, lease: &Lease, update: RecordUpdate) -> Result<bool> {
        let now = self.clock.now();
        let applied = self
            .store
            .commit(&lease.record_id, lease.token, update, now)
            .await?;
        if !applied {
            debug!(id = %lease.record_id, token = %lease.token, "Stale lease, write dropped");
        }
        Ok(applied)
    }

    /// Clear the lock without touching anything else
    pub async fn release(&self, lease: &Lease) -> Result<bool> {
        self.commit(lease, RecordUpdate::release()).await
    }

    /// Release early so the record becomes claimable again after `delay`
    pub async fn release_after(&self, lease: &Lease, delay: std::time::Duration) -> Result<bool> {
        let lock = self.retry_lock(lease, delay);
        self.commit(lease, RecordUpdate::release().locked_at(lock))
            .await
    }

    /// Lock value for a write that should make the record claimable after `delay`
    pub fn retry_lock(&self, lease: &Lease, delay: std::time::Duration) -> DateTime<Utc> {
        let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::days(365));
        lease.lock_for_retry_after(self.clock.now(), delay)
    }

    /// Whether the record's current lock (if any) has lapsed
    pub fn is_expired(record: &ResourceRecord, now: DateTime<Utc>, lease_duration: Duration) -> bool {
        lock_is_free(record.locked_at, now, lease_duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_frees_exactly_at_expiry() {
        let t = Utc::now();
        let lease = Duration::seconds(60);
        assert!(lock_is_free(None, t, lease));
        assert!(!lock_is_free(Some(t), t, lease));
        assert!(!lock_is_free(
            Some(t),
            t + lease - Duration::milliseconds(1),
            lease
        ));
        assert!(lock_is_free(Some(t), t + lease, lease));
    }

    #[test]
    fn retry_lock_is_backdated_by_the_lease() {
        let now = Utc::now();
        let lease = Lease {
            record_id: "r".to_string(),
            token: now,
            duration: Duration::seconds(60),
        };
        let lock = lease.lock_for_retry_after(now, Duration::seconds(5));
        assert_eq!(lock, now - Duration::seconds(55));
        assert!(!lock_is_free(
            Some(lock),
            now + Duration::seconds(4),
            lease.duration()
        ));
        assert!(lock_is_free(
            Some(lock),
            now + Duration::seconds(5),
            lease.duration()
        ));
    }

    #[test]
    fn retry_after_longer_than_lease_pushes_lock_forward() {
        let now = Utc::now();
        let lease = Lease {
            record_id: "r".to_string(),
            token: now,
            duration: Duration::seconds(10),
        };
        let lock = lease.lock_for_retry_after(now, Duration::seconds(40));
        assert_eq!(lock, now + Duration::seconds(30));
        assert!(!lock_is_free(Some(lock), now + Duration::seconds(39), lease.duration()));
        assert!(lock_is_free(Some(lock), now + Duration::seconds(40), lease.duration()));
    }
}
