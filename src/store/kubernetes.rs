//! Record store backed by `ManagedResource` custom resources
//!
//! Every mutation is read-modify-replace. The replace carries the
//! `resourceVersion` that was read, so the API server rejects it with 409 if any
//! other writer got there first; the operation then re-reads and re-decides.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kube::{
    api::{ListParams, PostParams},
    Api, Client,
};
use tracing::{debug, warn};

use super::ResourceStore;
use crate::crd::{self, ManagedResource, KIND_LABEL, OWNER_LABEL};
use crate::error::{Error, Result};
use crate::lease::lock_is_free;
use crate::resource::{DesiredState, RecordUpdate, ResourceKind, ResourceRecord};

/// Re-reads allowed for one logical write before giving up
const MAX_CAS_ATTEMPTS: usize = 5;

pub struct KubeStore {
    api: Api<ManagedResource>,
}

impl KubeStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    async fn fetch(&self, id: &str) -> Result<ManagedResource> {
        self.api
            .get_opt(id)
            .await?
            .ok_or_else(|| Error::not_found(id))
    }

    async fn list_selected(&self, selector: &str) -> Result<Vec<ResourceRecord>> {
        let list = self.api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items.iter().map(ManagedResource::to_record).collect())
    }

    /// Optimistic read-modify-write of one record.
    ///
    /// `mutate` decides on the freshly read record whether to write (returns
    /// `true`) or to leave it alone. Returns the resulting record and whether a
    /// write happened.
    async fn update_with<F>(&self, id: &str, mutate: F) -> Result<(ResourceRecord, bool)>
    where
        F: Fn(&mut ResourceRecord) -> Result<bool> + Send + Sync,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let mut resource = self.fetch(id).await?;
            let mut record = resource.to_record();
            if !mutate(&mut record)? {
                return Ok((record, false));
            }
            resource.store_record(&record);

            match self.api.replace(id, &PostParams::default(), &resource).await {
                Ok(_) => return Ok((record, true)),
                Err(kube::Error::Api(err)) if err.code == 409 => {
                    debug!(id = %id, attempt, "Write conflict, re-reading record");
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(id = %id, "Gave up after repeated write conflicts");
        Err(Error::Conflict(id.to_string()))
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn insert(&self, record: ResourceRecord) -> Result<ResourceRecord> {
        crd::validate(&record)?;
        let resource = ManagedResource::from_record(&record);
        match self.api.create(&PostParams::default(), &resource).await {
            Ok(created) => Ok(created.to_record()),
            Err(kube::Error::Api(err)) if err.code == 409 => Err(Error::Conflict(record.id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<ResourceRecord>> {
        Ok(self.api.get_opt(id).await?.map(|r| r.to_record()))
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceRecord>> {
        self.list_selected(&format!("{KIND_LABEL}={kind}")).await
    }

    async fn list_owned(&self, kind: ResourceKind, owner_key: &str) -> Result<Vec<ResourceRecord>> {
        crd::validate_owner_key(owner_key)?;
        self.list_selected(&format!("{KIND_LABEL}={kind},{OWNER_LABEL}={owner_key}"))
            .await
    }

    async fn set_desired_state(
        &self,
        id: &str,
        desired: DesiredState,
        now: DateTime<Utc>,
    ) -> Result<ResourceRecord> {
        let (record, _) = self
            .update_with(id, |record| record.change_desired_state(desired, now))
            .await?;
        Ok(record)
    }

    async fn compare_and_lock(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<ResourceRecord>> {
        let result = self
            .update_with(id, |record| {
                if !lock_is_free(record.locked_at, now, lease_duration) {
                    return Ok(false);
                }
                record.locked_at = Some(now);
                Ok(true)
            })
            .await;

        match result {
            Ok((record, true)) => Ok(Some(record)),
            Ok((_, false)) => Ok(None),
            // Sustained contention on the claim is just another worker winning
            Err(Error::Conflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn commit(
        &self,
        id: &str,
        token: DateTime<Utc>,
        update: RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (_, written) = self
            .update_with(id, |record| {
                if record.locked_at != Some(token) {
                    return Ok(false);
                }
                record.apply_update(&update, now);
                Ok(true)
            })
            .await?;
        Ok(written)
    }
}
