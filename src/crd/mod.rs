//! Custom Resource Definitions for the Kubernetes-backed record store

mod managed_resource;

pub use managed_resource::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> serde_yaml::Result<Vec<String>> {
    Ok(vec![serde_yaml::to_string(&ManagedResource::crd())?])
}
