//! Remote manifests as Open Cluster Management ManifestWorks

use super::{delete_object, derived_meta, list_params, map_kube_error, object_meta, KubeCluster};
use crate::crd::{ManifestWork, ManifestWorkSpec, ManifestsTemplate};
use crate::domain::{ApplyOutcome, DerivedObject, ObjectStore, RemoteManifest};
use crate::error::Result;
use crate::labels::FIELD_MANAGER;
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::Api;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

pub fn to_manifest_work(manifest: &RemoteManifest) -> ManifestWork {
    ManifestWork {
        metadata: object_meta(&manifest.meta),
        spec: ManifestWorkSpec {
            workload: ManifestsTemplate {
                manifests: manifest.manifests.clone(),
            },
        },
        status: None,
    }
}

fn from_manifest_work(work: &ManifestWork) -> RemoteManifest {
    RemoteManifest {
        meta: derived_meta(&work.metadata),
        manifests: work.spec.workload.manifests.clone(),
        applied: work.has_condition("Applied"),
        available: work.has_condition("Available"),
    }
}

#[async_trait]
impl ObjectStore<RemoteManifest> for KubeCluster {
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<RemoteManifest>> {
        let api: Api<ManifestWork> = self.api(namespace);
        let list = api.list(&list_params(selector)).await?;
        Ok(list.items.iter().map(from_manifest_work).collect())
    }

    #[instrument(skip_all, fields(work = %object.name(), cluster = %object.namespace()))]
    async fn apply(&self, object: &RemoteManifest) -> Result<ApplyOutcome> {
        let api: Api<ManifestWork> = self.api(Some(object.namespace()));

        let existing = api.get_opt(object.name()).await?;
        if let Some(existing) = &existing {
            let existing = from_manifest_work(existing);
            if existing.desired_hash().is_some() && existing.desired_hash() == object.desired_hash() {
                return Ok(ApplyOutcome::Unchanged);
            }
        }

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(object.name(), &params, &Patch::Apply(&to_manifest_work(object)))
            .await
            .map_err(|e| map_kube_error(RemoteManifest::KIND, object.name(), e))?;

        let outcome = if existing.is_some() {
            ApplyOutcome::Patched
        } else {
            ApplyOutcome::Created
        };
        debug!(%outcome, "Applied manifest work");
        Ok(outcome)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ManifestWork> = self.api(Some(namespace));
        delete_object(&api, RemoteManifest::KIND, name).await
    }
}
