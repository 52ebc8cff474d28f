//! ManagedResource Custom Resource Definition
//!
//! One document per resource record. The reconciliation fields live in the spec
//! rather than a status subresource so that a single `replace` guarded by
//! `resourceVersion` covers the desired state, the phase and the lock together.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{api::ObjectMeta, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::resource::{DesiredState, Phase, Reconcilable, ResourceKind, ResourceRecord};

/// Label carrying the resource kind
pub const KIND_LABEL: &str = "reconcile.controlplane.dev/kind";

/// Label carrying the owner key used for cascades
pub const OWNER_LABEL: &str = "reconcile.controlplane.dev/owner-key";

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_VALUE_LEN: usize = 63;

/// ManagedResource specification: the persisted reconciliation record
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "reconcile.controlplane.dev",
    version = "v1alpha1",
    kind = "ManagedResource",
    plural = "managedresources",
    singular = "managedresource",
    shortname = "mres",
    namespaced,
    printcolumn = r#"{"name": "Kind", "type": "string", "jsonPath": ".spec.resourceKind"}"#,
    printcolumn = r#"{"name": "Desired", "type": "string", "jsonPath": ".spec.desiredState"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".spec.phase"}"#,
    printcolumn = r#"{"name": "Message", "type": "string", "jsonPath": ".spec.message", "priority": 1}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceSpec {
    /// Kind tag selecting the transition table
    pub resource_kind: ResourceKind,

    /// Join key shared with related resources
    pub owner_key: String,

    /// State requested by the owner or by a cascade
    pub desired_state: DesiredState,

    /// Phase written by the engine
    pub phase: Phase,

    /// Start of the current lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,

    /// Last error or status note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Consecutive retryable failures of the current transition
    #[serde(default)]
    pub attempts: u32,

    /// Expiry instant (subscriptions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ManagedResource {
    /// Build a new document for a record
    pub fn from_record(record: &ResourceRecord) -> Self {
        let labels = BTreeMap::from([
            (KIND_LABEL.to_string(), record.kind.as_str().to_string()),
            (OWNER_LABEL.to_string(), record.owner_key.clone()),
        ]);

        let mut resource = ManagedResource::new(&record.id, spec_from_record(record));
        resource.metadata = ObjectMeta {
            name: Some(record.id.clone()),
            labels: Some(labels),
            ..Default::default()
        };
        resource
    }

    /// Domain view of this document
    pub fn to_record(&self) -> ResourceRecord {
        ResourceRecord {
            id: self.name_any(),
            kind: self.spec.resource_kind,
            owner_key: self.spec.owner_key.clone(),
            desired_state: self.spec.desired_state,
            phase: self.spec.phase,
            locked_at: self.spec.locked_at,
            message: self.spec.message.clone(),
            attempts: self.spec.attempts,
            expires_at: self.spec.expires_at,
            created_at: self.spec.created_at,
            updated_at: self.spec.updated_at,
        }
    }

    /// Overwrite the spec with a mutated record, keeping metadata (and with it
    /// the `resourceVersion` the write is conditioned on)
    pub fn store_record(&mut self, record: &ResourceRecord) {
        self.spec = spec_from_record(record);
    }
}

fn spec_from_record(record: &ResourceRecord) -> ManagedResourceSpec {
    ManagedResourceSpec {
        resource_kind: record.kind,
        owner_key: record.owner_key.clone(),
        desired_state: record.desired_state,
        phase: record.phase,
        locked_at: record.locked_at,
        message: record.message.clone(),
        attempts: record.attempts,
        expires_at: record.expires_at,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

/// Check that a record can be stored as a document.
///
/// The id becomes `metadata.name` and the owner key a label value, so both
/// must satisfy the API server's syntax.
pub fn validate(record: &ResourceRecord) -> Result<()> {
    let id = record.id.as_str();
    if id.is_empty() || id.len() > MAX_NAME_LEN {
        return Err(Error::validation(format!(
            "Invalid record id '{}': must be 1-{} characters",
            id, MAX_NAME_LEN
        )));
    }
    let lowercase = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    if !id.chars().all(|c| lowercase(c) || c == '-' || c == '.')
        || !id.starts_with(lowercase)
        || !id.ends_with(lowercase)
    {
        return Err(Error::validation(format!(
            "Invalid record id '{}': must be lowercase alphanumerics, '-' or '.', \
             starting and ending with an alphanumeric",
            id
        )));
    }

    validate_owner_key(&record.owner_key)
}

/// Check that an owner key is usable as a label value and in a label selector
pub fn validate_owner_key(owner_key: &str) -> Result<()> {
    if owner_key.len() > MAX_LABEL_VALUE_LEN {
        return Err(Error::validation(format!(
            "Invalid owner key '{}': longer than {} characters",
            owner_key, MAX_LABEL_VALUE_LEN
        )));
    }
    if owner_key.is_empty() {
        return Ok(());
    }
    let alphanumeric = |c: char| c.is_ascii_alphanumeric();
    if !owner_key
        .chars()
        .all(|c| alphanumeric(c) || matches!(c, '-' | '_' | '.'))
        || !owner_key.starts_with(alphanumeric)
        || !owner_key.ends_with(alphanumeric)
    {
        return Err(Error::validation(format!(
            "Invalid owner key '{}': must be alphanumerics, '-', '_' or '.', \
             starting and ending with an alphanumeric",
            owner_key
        )));
    }
    Ok(())
}

impl Reconcilable for ManagedResource {
    fn kind(&self) -> ResourceKind {
        self.spec.resource_kind
    }

    fn desired_state(&self) -> DesiredState {
        self.spec.desired_state
    }

    fn phase(&self) -> Phase {
        self.spec.phase
    }

    fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.spec.locked_at
    }

    fn attempts(&self) -> u32 {
        self.spec.attempts
    }
}
