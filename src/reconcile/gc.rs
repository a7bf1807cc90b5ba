//! Garbage collection of derived objects
//!
//! Two sweeps run at the end of every pass:
//!
//! - scope sweep: objects of the module whose correlation label (kernel
//!   version, or managed cluster for remote manifests) is not in the scope
//!   computed by the pass are deleted. Objects without the label are not ours
//!   to judge and are left alone.
//! - retention sweep: build and sign jobs that finished longer ago than the
//!   configured retention are deleted, except the newest succeeded job of each
//!   (kernel version, stage). It keeps a completed kernel completed when the
//!   registry cannot confirm the image.
//!
//! Jobs are selected by owner kind as well as module name, so a Module and a
//! ManagedClusterModule sharing a name never sweep each other's jobs.
//!
//! Deletions are independent. A failure is logged and reported; it never
//! stops the sweep or fails the pass.

use crate::domain::{
    DerivedObject, ExecutionJob, JobPhase, JobStoreRef, ManifestStoreRef, ModuleRef, ObjectStore,
    WorkloadStoreRef,
};
use crate::crd::{ManagedClusterModule, Module};
use crate::labels::{module_selector, owner_selector, MANAGED_CLUSTER_LABEL, TARGET_KERNEL_LABEL};
use crate::metrics;
use chrono::{DateTime, Utc};
use kube::Resource;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Label values still in use after a pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcScope {
    values: BTreeSet<String>,
}

impl GcScope {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.contains(value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// `Kind/namespace/name` of every deleted object
    pub deleted: Vec<String>,
    /// Objects (or listings) that could not be processed, with the error
    pub failed: Vec<(String, String)>,
}

impl GcReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: GcReport) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }

    fn was_deleted(&self, id: &str) -> bool {
        self.deleted.iter().any(|d| d == id)
    }
}

fn object_id<T: DerivedObject>(object: &T) -> String {
    format!("{}/{}/{}", T::KIND, object.namespace(), object.name())
}

async fn delete_object<T: DerivedObject>(
    store: &dyn ObjectStore<T>,
    object: &T,
    report: &mut GcReport,
) {
    let id = object_id(object);
    match store.delete(object.namespace(), object.name()).await {
        Ok(()) => {
            info!(object = %id, "Deleted stale object");
            metrics::GC_DELETIONS_TOTAL
                .with_label_values(&[T::KIND, "deleted"])
                .inc();
            report.deleted.push(id);
        }
        Err(e) => {
            warn!(object = %id, error = %e, "Failed to delete stale object");
            metrics::GC_DELETIONS_TOTAL
                .with_label_values(&[T::KIND, "failed"])
                .inc();
            report.failed.push((id, e.to_string()));
        }
    }
}

/// Delete objects matching `selector` whose `label` value is outside `scope`
pub async fn sweep_out_of_scope<T: DerivedObject>(
    store: &dyn ObjectStore<T>,
    namespace: Option<&str>,
    selector: &BTreeMap<String, String>,
    label: &str,
    scope: &GcScope,
    report: &mut GcReport,
) {
    let objects = match store.list(namespace, selector).await {
        Ok(objects) => objects,
        Err(e) => {
            warn!(kind = T::KIND, error = %e, "Failed to list objects for garbage collection");
            report.failed.push((format!("{}/*", T::KIND), e.to_string()));
            return;
        }
    };

    for object in &objects {
        let Some(value) = object.label(label) else {
            continue;
        };
        if !scope.contains(value) {
            delete_object(store, object, report).await;
        }
    }
}

/// Newest succeeded job of every (kernel version, stage) pair
fn newest_succeeded(jobs: &[ExecutionJob]) -> BTreeSet<String> {
    let mut newest: BTreeMap<(String, String), (DateTime<Utc>, String)> = BTreeMap::new();
    for job in jobs.iter().filter(|j| j.phase == JobPhase::Succeeded) {
        let Some(finished) = job.finished_at() else {
            continue;
        };
        let key = (
            job.label(TARGET_KERNEL_LABEL).unwrap_or_default().to_string(),
            job.stage.to_string(),
        );
        let candidate = (finished, job.name().to_string());
        match newest.get(&key) {
            Some(current) if *current >= candidate => {}
            _ => {
                newest.insert(key, candidate);
            }
        }
    }
    newest.into_values().map(|(_, name)| name).collect()
}

/// Delete jobs that reached a terminal phase more than `retention` ago
pub async fn sweep_expired_jobs(
    store: &dyn ObjectStore<ExecutionJob>,
    namespace: Option<&str>,
    selector: &BTreeMap<String, String>,
    retention: Duration,
    now: DateTime<Utc>,
    report: &mut GcReport,
) {
    let jobs = match store.list(namespace, selector).await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "Failed to list jobs for retention sweep");
            report.failed.push(("Job/*".into(), e.to_string()));
            return;
        }
    };

    let retention =
        chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::weeks(5200));
    let retained = newest_succeeded(&jobs);
    for job in &jobs {
        if report.was_deleted(&object_id(job)) || retained.contains(job.name()) {
            continue;
        }
        let Some(finished) = job.finished_at() else {
            continue;
        };
        if now.signed_duration_since(finished) > retention {
            delete_object(store, job, report).await;
        }
    }
}

/// Garbage collector for the objects derived from one module
pub struct GarbageCollector {
    owner_kind: String,
    jobs: JobStoreRef,
    workloads: Option<WorkloadStoreRef>,
    manifests: Option<ManifestStoreRef>,
    retention: Duration,
}

impl GarbageCollector {
    /// Collector for a spoke: jobs and kernel workloads
    pub fn for_spoke(jobs: JobStoreRef, workloads: WorkloadStoreRef, retention: Duration) -> Self {
        Self {
            owner_kind: Module::kind(&()).into_owned(),
            jobs,
            workloads: Some(workloads),
            manifests: None,
            retention,
        }
    }

    /// Collector for a hub: jobs and remote manifests
    pub fn for_hub(jobs: JobStoreRef, manifests: ManifestStoreRef, retention: Duration) -> Self {
        Self {
            owner_kind: ManagedClusterModule::kind(&()).into_owned(),
            jobs,
            workloads: None,
            manifests: Some(manifests),
            retention,
        }
    }

    /// Sweep workloads and jobs of `module` outside `kernels`
    #[instrument(skip_all, fields(module = %module.name, namespace = %module.namespace))]
    pub async fn collect(
        &self,
        module: &ModuleRef,
        kernels: &GcScope,
        now: DateTime<Utc>,
    ) -> GcReport {
        let namespace = Some(module.namespace.as_str());
        let jobs = owner_selector(&self.owner_kind, &module.name);
        let mut report = GcReport::default();

        if let Some(workloads) = &self.workloads {
            sweep_out_of_scope(
                workloads.as_ref(),
                namespace,
                &module_selector(&module.name),
                TARGET_KERNEL_LABEL,
                kernels,
                &mut report,
            )
            .await;
        }
        sweep_out_of_scope(
            self.jobs.as_ref(),
            namespace,
            &jobs,
            TARGET_KERNEL_LABEL,
            kernels,
            &mut report,
        )
        .await;
        sweep_expired_jobs(
            self.jobs.as_ref(),
            namespace,
            &jobs,
            self.retention,
            now,
            &mut report,
        )
        .await;

        report
    }

    /// Sweep remote manifests of `module` addressed to clusters outside `clusters`
    #[instrument(skip_all, fields(module = %module))]
    pub async fn collect_manifests(&self, module: &str, clusters: &GcScope) -> GcReport {
        let mut report = GcReport::default();
        if let Some(manifests) = &self.manifests {
            sweep_out_of_scope(
                manifests.as_ref(),
                None,
                &module_selector(module),
                MANAGED_CLUSTER_LABEL,
                clusters,
                &mut report,
            )
            .await;
        }
        report
    }
}
