//! Kubernetes adapter
//!
//! [`KubeCluster`] implements every cluster-facing port over a
//! `kube::Client`. Derived objects are translated to and from their API
//! types in the submodules; this module holds the shared plumbing.

mod inventory;
mod jobs;
mod manifests;
mod modules;
mod node_state;
mod workloads;

pub use jobs::{job_phase, to_job};
pub use manifests::to_manifest_work;
pub use workloads::to_daemon_set;

use crate::domain::{DerivedMeta, OwnerRef};
use crate::error::Error;
use crate::labels::selector_string;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{DeleteParams, ListParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

/// Adapter implementing the cluster ports against the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Map an API error, surfacing write conflicts as [`Error::Conflict`]
pub(crate) fn map_kube_error(kind: &str, name: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

pub(crate) fn list_params(selector: &BTreeMap<String, String>) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&selector_string(selector))
    }
}

/// Delete an object in the background; a missing object is not an error
pub(crate) async fn delete_object<K>(api: &Api<K>, kind: &str, name: &str) -> crate::Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api
        .delete(name, &DeleteParams::background())
        .await
        .map_err(|e| map_kube_error(kind, name, e))
    {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(kind, name, "Object already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn owner_reference(owner: &OwnerRef) -> OwnerReference {
    OwnerReference {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// API metadata of a derived object
pub(crate) fn object_meta(meta: &DerivedMeta) -> ObjectMeta {
    ObjectMeta {
        name: Some(meta.name.clone()),
        namespace: Some(meta.namespace.clone()),
        labels: Some(meta.labels.clone()),
        annotations: (!meta.annotations.is_empty()).then(|| meta.annotations.clone()),
        owner_references: meta.owner.as_ref().map(|o| vec![owner_reference(o)]),
        ..Default::default()
    }
}

/// Derived metadata read back from an API object
pub(crate) fn derived_meta(meta: &ObjectMeta) -> DerivedMeta {
    DerivedMeta {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        owner: meta
            .owner_references
            .iter()
            .flatten()
            .find(|o| o.controller == Some(true))
            .map(|o| OwnerRef {
                api_version: o.api_version.clone(),
                kind: o.kind.clone(),
                name: o.name.clone(),
                uid: o.uid.clone(),
            }),
        created_at: meta.creation_timestamp.as_ref().map(|t| t.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::kernel_labels;
    use kube::core::ErrorResponse;

    #[test]
    fn test_meta_round_trip() {
        let owner = OwnerRef {
            api_version: "kmm.sigs.x-k8s.io/v1beta1".into(),
            kind: "Module".into(),
            name: "kmod".into(),
            uid: "uid-1".into(),
        };
        let meta = DerivedMeta::new("kmod-abc", "drivers", kernel_labels("kmod", "5.14.0-1"))
            .with_owner(&owner)
            .with_hash("deadbeef");

        let back = derived_meta(&object_meta(&meta));
        assert_eq!(back, meta);
    }

    #[test]
    fn test_conflict_mapping() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        });
        assert!(matches!(
            map_kube_error("DaemonSet", "kmod-abc", err),
            Error::Conflict { .. }
        ));
    }

    #[test]
    fn test_missing_object_maps_to_not_found() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "jobs.batch \"kmod-build-abc\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        let mapped = map_kube_error("Job", "kmod-build-abc", err);
        assert!(mapped.is_not_found());
        assert!(mapped.is_transient());
    }

    #[test]
    fn test_list_params() {
        assert_eq!(list_params(&BTreeMap::new()).label_selector, None);
        assert_eq!(
            list_params(&kernel_labels("kmod", "5.14.0-1")).label_selector.as_deref(),
            Some("kmm.node.kubernetes.io/module.name=kmod,kmm.node.kubernetes.io/target-kernel=5.14.0-1")
        );
    }
}
