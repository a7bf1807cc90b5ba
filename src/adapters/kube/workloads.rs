//! Workloads as `apps/v1` DaemonSets

use super::{delete_object, derived_meta, list_params, map_kube_error, object_meta, KubeCluster};
use crate::domain::{ApplyOutcome, DerivedObject, ObjectStore, Workload, WorkloadSpec, WorkloadStatus};
use crate::error::Result;
use crate::labels::{FIELD_MANAGER, ROLE_LABEL, ROLE_MODULE_LOADER};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ExecAction, Lifecycle, LifecycleHandler, LocalObjectReference, PodSpec,
    PodTemplateSpec, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Patch, PatchParams};
use kube::Api;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

/// Render a workload as a DaemonSet
///
/// The pod selector is the full label set of the workload, which is fixed
/// for a given workload name.
pub fn to_daemon_set(workload: &Workload) -> DaemonSet {
    let spec = &workload.spec;
    let labels = workload.meta.labels.clone();
    let container_name = workload
        .label(ROLE_LABEL)
        .unwrap_or(ROLE_MODULE_LOADER)
        .to_string();

    let lifecycle = (!spec.pre_stop.is_empty()).then(|| Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(spec.pre_stop.clone()),
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    DaemonSet {
        metadata: object_meta(&workload.meta),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: container_name,
                        image: Some(spec.image.clone()),
                        command: non_empty(&spec.command),
                        args: non_empty(&spec.args),
                        lifecycle,
                        security_context: spec.privileged.then(|| SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    node_selector: (!spec.node_selector.is_empty())
                        .then(|| spec.node_selector.clone()),
                    service_account_name: spec.service_account.clone(),
                    image_pull_secrets: spec.image_pull_secret.as_ref().map(|secret| {
                        vec![LocalObjectReference {
                            name: Some(secret.clone()),
                        }]
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn from_daemon_set(ds: &DaemonSet) -> Workload {
    let pod = ds.spec.as_ref().and_then(|s| s.template.spec.as_ref());
    let container = pod.and_then(|p| p.containers.first());
    let pre_stop = container
        .and_then(|c| c.lifecycle.as_ref())
        .and_then(|l| l.pre_stop.as_ref())
        .and_then(|h| h.exec.as_ref())
        .and_then(|e| e.command.clone())
        .unwrap_or_default();

    let status = ds.status.as_ref();
    let count = |n: i32| u32::try_from(n).unwrap_or(0);

    Workload {
        meta: derived_meta(&ds.metadata),
        spec: WorkloadSpec {
            image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
            command: container.and_then(|c| c.command.clone()).unwrap_or_default(),
            args: container.and_then(|c| c.args.clone()).unwrap_or_default(),
            pre_stop,
            node_selector: pod.and_then(|p| p.node_selector.clone()).unwrap_or_default(),
            service_account: pod.and_then(|p| p.service_account_name.clone()),
            image_pull_secret: pod
                .and_then(|p| p.image_pull_secrets.as_ref())
                .and_then(|s| s.first())
                .and_then(|s| s.name.clone()),
            privileged: container
                .and_then(|c| c.security_context.as_ref())
                .and_then(|s| s.privileged)
                .unwrap_or(false),
        },
        status: WorkloadStatus {
            desired: status.map(|s| count(s.desired_number_scheduled)).unwrap_or(0),
            ready: status.map(|s| count(s.number_ready)).unwrap_or(0),
            available: status
                .and_then(|s| s.number_available)
                .map(count)
                .unwrap_or(0),
        },
    }
}

#[async_trait]
impl ObjectStore<Workload> for KubeCluster {
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Workload>> {
        let api: Api<DaemonSet> = self.api(namespace);
        let list = api.list(&list_params(selector)).await?;
        Ok(list.items.iter().map(from_daemon_set).collect())
    }

    #[instrument(skip_all, fields(workload = %object.name(), namespace = %object.namespace()))]
    async fn apply(&self, object: &Workload) -> Result<ApplyOutcome> {
        let api: Api<DaemonSet> = self.api(Some(object.namespace()));

        let existing = api.get_opt(object.name()).await?;
        if let Some(existing) = &existing {
            let existing = from_daemon_set(existing);
            if existing.desired_hash().is_some() && existing.desired_hash() == object.desired_hash() {
                return Ok(ApplyOutcome::Unchanged);
            }
        }

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(object.name(), &params, &Patch::Apply(&to_daemon_set(object)))
            .await
            .map_err(|e| map_kube_error(Workload::KIND, object.name(), e))?;

        let outcome = if existing.is_some() {
            ApplyOutcome::Patched
        } else {
            ApplyOutcome::Created
        };
        debug!(%outcome, "Applied daemon set");
        Ok(outcome)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DaemonSet> = self.api(Some(namespace));
        delete_object(&api, Workload::KIND, name).await
    }
}
