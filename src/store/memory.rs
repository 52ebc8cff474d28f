//! In-process record store
//!
//! Each operation runs under one write lock of the map, which makes every
//! read-check-write sequence atomic with respect to other workers in the
//! process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::ResourceStore;
use crate::error::{Error, Result};
use crate::lease::lock_is_free;
use crate::resource::{DesiredState, RecordUpdate, ResourceKind, ResourceRecord};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ResourceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn insert(&self, record: ResourceRecord) -> Result<ResourceRecord> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(Error::Conflict(record.id));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<ResourceRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect())
    }

    async fn list_owned(&self, kind: ResourceKind, owner_key: &str) -> Result<Vec<ResourceRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.kind == kind && r.owner_key == owner_key)
            .cloned()
            .collect())
    }

    async fn set_desired_state(
        &self,
        id: &str,
        desired: DesiredState,
        now: DateTime<Utc>,
    ) -> Result<ResourceRecord> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| Error::not_found(id))?;
        record.change_desired_state(desired, now)?;
        Ok(record.clone())
    }

    async fn compare_and_lock(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<ResourceRecord>> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| Error::not_found(id))?;
        if !lock_is_free(record.locked_at, now, lease_duration) {
            return Ok(None);
        }
        record.locked_at = Some(now);
        Ok(Some(record.clone()))
    }

    async fn commit(
        &self,
        id: &str,
        token: DateTime<Utc>,
        update: RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| Error::not_found(id))?;
        if record.locked_at != Some(token) {
            return Ok(false);
        }
        record.apply_update(&update, now);
        Ok(true)
    }
}
