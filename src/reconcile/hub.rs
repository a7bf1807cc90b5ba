//! ManagedClusterModule reconciliation hooks
//!
//! Hub-side pass: managed clusters are the targets and their kernel versions
//! come from a cluster claim. Images are built and signed on the hub; each
//! cluster then receives a ManifestWork carrying a spoke Module whose kernel
//! mappings point at the finished images, so spokes never build anything.

use super::driver::{ReconcileDriver, ReconcileHooks};
use super::gc::{GarbageCollector, GcReport, GcScope};
use super::module::owner_ref;
use super::selector::{Selection, SkipReason, SkippedTarget};
use super::status::hub_status;
use crate::config::OperatorConfig;
use crate::crd::{KernelMapping, ManagedClusterModule, Module, ModuleSpec};
use crate::domain::{
    content_hash, ApplyOutcome, ClusterInventoryRef, DerivedMeta, DerivedObject,
    HubModuleStoreRef, ImageRegistryRef, JobStoreRef, ManifestStoreRef, ModuleRef, ObjectKey,
    OwnerRef, RemoteManifest,
};
use crate::error::Result;
use crate::kernel::{resolve_kernel, KernelVersion, MappingCache, OsConfig};
use crate::labels::{module_selector, MANAGED_CLUSTER_LABEL};
use crate::pipeline::{BuildSignOrchestrator, JobStage, Orchestration};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ports the ManagedClusterModule pass depends on
#[derive(Clone)]
pub struct HubPorts {
    pub modules: HubModuleStoreRef,
    pub clusters: ClusterInventoryRef,
    pub jobs: JobStoreRef,
    pub manifests: ManifestStoreRef,
    pub registry: ImageRegistryRef,
}

/// Targets of one hub pass
#[derive(Debug)]
pub struct HubTargets {
    /// Jobs of the pass live in the hub job namespace
    pub module: ModuleRef,
    pub owner: OwnerRef,
    pub selection: Selection,
    /// Selected clusters with their normalized, sorted kernel versions
    pub clusters: BTreeMap<String, Vec<KernelVersion>>,
    /// Clusters matching the selector, with or without a claim
    pub selected: BTreeSet<String>,
}

/// Clusters that received a manifest during the pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubProjection {
    pub delivered: BTreeSet<String>,
}

/// Normalize, sort and dedup the kernel versions of a claim
fn claim_kernels(raw: &[String]) -> Vec<KernelVersion> {
    let kernels: BTreeSet<KernelVersion> = raw
        .iter()
        .map(|k| KernelVersion::normalize(k))
        .filter(|k| !k.is_empty())
        .collect();
    kernels.into_iter().collect()
}

/// Spoke Module pinned to the images built for one cluster
pub fn spoke_module(
    mcm: &ManagedClusterModule,
    images: &BTreeMap<&KernelVersion, &str>,
) -> Module {
    let kernel_mappings = images
        .iter()
        .map(|(kernel, image)| KernelMapping {
            literal: Some(kernel.to_string()),
            container_image: Some(image.to_string()),
            ..Default::default()
        })
        .collect();

    let spec = ModuleSpec {
        container_image: None,
        build: None,
        sign: None,
        kernel_mappings,
        ..mcm.spec.module_spec.clone()
    };
    let mut module = Module::new(mcm.name(), spec);
    module.metadata.namespace = Some(mcm.spec.spoke_namespace.clone());
    module
}

pub struct HubHooks {
    modules: HubModuleStoreRef,
    clusters: ClusterInventoryRef,
    manifests: ManifestStoreRef,
    orchestrator: BuildSignOrchestrator,
    gc: GarbageCollector,
    config: Arc<OperatorConfig>,
}

impl HubHooks {
    pub fn new(config: Arc<OperatorConfig>, ports: HubPorts) -> Self {
        let build = JobStage::build(ports.jobs.clone(), ports.registry.clone(), config.clone());
        let sign = JobStage::sign(ports.jobs.clone(), ports.registry.clone(), config.clone());

        Self {
            orchestrator: BuildSignOrchestrator::new(Arc::new(build), Arc::new(sign)),
            gc: GarbageCollector::for_hub(
                ports.jobs,
                ports.manifests.clone(),
                config.job_retention(),
            ),
            modules: ports.modules,
            clusters: ports.clusters,
            manifests: ports.manifests,
            config,
        }
    }

    fn manifest(
        &self,
        mcm: &ManagedClusterModule,
        owner: &OwnerRef,
        cluster: &str,
        images: &BTreeMap<&KernelVersion, &str>,
    ) -> Result<RemoteManifest> {
        let payload = serde_json::to_value(spoke_module(mcm, images))?;
        let manifests = vec![payload];
        let hash = content_hash(&manifests)?;

        let mut labels = module_selector(mcm.name());
        labels.insert(MANAGED_CLUSTER_LABEL.to_string(), cluster.to_string());

        Ok(RemoteManifest {
            meta: DerivedMeta::new(mcm.name(), cluster, labels)
                .with_owner(owner)
                .with_hash(hash),
            manifests,
            applied: false,
            available: false,
        })
    }
}

#[async_trait]
impl ReconcileHooks for HubHooks {
    type Object = ManagedClusterModule;
    type Targets = HubTargets;
    type Outcomes = BTreeMap<KernelVersion, Orchestration>;
    type Projection = HubProjection;

    fn controller(&self) -> &'static str {
        "managed-cluster-module"
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Option<ManagedClusterModule>> {
        self.modules.get(&key.name).await
    }

    async fn resolve(&self, mcm: &ManagedClusterModule) -> Result<HubTargets> {
        let module = ModuleRef::new(mcm.name(), self.config.hub_job_namespace.clone());
        let owner = owner_ref(mcm)?;
        let spec = &mcm.spec.module_spec;

        let found = self.clusters.list_clusters(&mcm.spec.selector).await?;
        let mut selection = Selection {
            candidates: found.len(),
            ..Default::default()
        };
        let mut cache = MappingCache::new();
        let mut clusters = BTreeMap::new();

        for cluster in &found {
            let Some(raw) = &cluster.kernel_versions else {
                warn!(cluster = %cluster.name, "Cluster has no kernel-versions claim; skipping");
                selection.skipped.push(SkippedTarget {
                    target: cluster.name.clone(),
                    kernel_version: None,
                    reason: SkipReason::MissingKernelVersion,
                });
                continue;
            };

            let kernels = claim_kernels(raw);
            let os = OsConfig::from_node_labels(&cluster.labels);
            for kernel in &kernels {
                selection.record(&mut cache, &cluster.name, kernel.as_str(), |k| {
                    resolve_kernel(&module, spec, k, &os)
                });
            }
            clusters.insert(cluster.name.clone(), kernels);
        }

        debug!(
            clusters = found.len(),
            kernels = selection.groups.len(),
            resolutions = cache.resolutions(),
            "Resolved cluster kernels"
        );

        Ok(HubTargets {
            module,
            owner,
            selection,
            clusters,
            selected: found.into_iter().map(|c| c.name).collect(),
        })
    }

    async fn orchestrate(&self, targets: &HubTargets) -> Result<Self::Outcomes> {
        self.orchestrator
            .run_all(&targets.owner, targets.selection.mappings())
            .await
    }

    async fn project(
        &self,
        mcm: &ManagedClusterModule,
        targets: &HubTargets,
        outcomes: &Self::Outcomes,
    ) -> Result<HubProjection> {
        let mut projection = HubProjection::default();

        for (cluster, kernels) in &targets.clusters {
            let resolved: Vec<_> = kernels
                .iter()
                .filter(|k| targets.selection.groups.contains_key(*k))
                .collect();
            if resolved.is_empty() {
                debug!(cluster = %cluster, "No resolved kernel; nothing to ship");
                continue;
            }

            let images: Option<BTreeMap<&KernelVersion, &str>> = resolved
                .iter()
                .map(|k| match outcomes.get(*k) {
                    Some(Orchestration::Completed { image }) => Some((*k, image.as_str())),
                    _ => None,
                })
                .collect();
            let Some(images) = images else {
                debug!(cluster = %cluster, "Images still in the pipeline");
                continue;
            };

            let manifest = self.manifest(mcm, &targets.owner, cluster, &images)?;
            let outcome = self.manifests.apply(&manifest).await?;
            if outcome != ApplyOutcome::Unchanged {
                info!(cluster = %cluster, "ManifestWork {}", outcome);
            }
            projection.delivered.insert(cluster.clone());
        }

        Ok(projection)
    }

    async fn aggregate(
        &self,
        mcm: &ManagedClusterModule,
        targets: &HubTargets,
        outcomes: &Self::Outcomes,
        _projection: &HubProjection,
    ) -> Result<()> {
        let manifests: Vec<RemoteManifest> = self
            .manifests
            .list(None, &module_selector(mcm.name()))
            .await?
            .into_iter()
            .filter(|m| {
                m.label(MANAGED_CLUSTER_LABEL)
                    .map(|c| targets.selected.contains(c))
                    .unwrap_or(false)
            })
            .collect();

        let status = hub_status(
            mcm.status.as_ref(),
            targets.selected.len(),
            &targets.selection,
            outcomes,
            &manifests,
        );
        if mcm.status.as_ref() == Some(&status) {
            debug!("Status unchanged");
            return Ok(());
        }
        self.modules.update_status(mcm, &status).await
    }

    async fn collect_garbage(&self, targets: &HubTargets) -> GcReport {
        let mut report = self
            .gc
            .collect(&targets.module, &targets.selection.scope(), Utc::now())
            .await;
        let clusters = GcScope::new(targets.selected.iter().cloned());
        report.merge(
            self.gc
                .collect_manifests(&targets.module.name, &clusters)
                .await,
        );
        report
    }

    /// Hub passes are re-triggered by events on their owned jobs
    fn requeue_after(&self, _outcomes: &Self::Outcomes) -> Option<Duration> {
        None
    }
}

/// Reconciler for hub ManagedClusterModules
pub type HubReconciler = ReconcileDriver<HubHooks>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryCluster;
    use crate::crd::{BuildSpec, ManagedClusterModuleSpec};
    use crate::domain::{JobPhase, StageKind};
    use crate::reconcile::driver::ReconcileOutcome;
    use crate::reconcile::status::CONDITION_READY;

    fn mcm(build: bool) -> ManagedClusterModule {
        let module_spec = ModuleSpec {
            selector: BTreeMap::from([("role".to_string(), "worker".to_string())]),
            module_name: "kmm_ci_a".into(),
            module_parameters: vec![],
            container_image: Some("registry.local/kmod:${KERNEL_FULL_VERSION}".into()),
            build: build.then(|| BuildSpec {
                dockerfile_config_map: "kmod-dockerfile".into(),
                ..Default::default()
            }),
            sign: None,
            kernel_mappings: vec![KernelMapping {
                regexp: Some(r"^5\.".into()),
                ..Default::default()
            }],
            device_plugin: None,
            image_repo_secret: None,
            service_account_name: None,
        };
        let mut mcm = ManagedClusterModule::new(
            "kmod",
            ManagedClusterModuleSpec {
                module_spec,
                spoke_namespace: "drivers".into(),
                selector: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            },
        );
        mcm.metadata.uid = Some("uid-hub".into());
        mcm
    }

    fn reconciler(cluster: &Arc<InMemoryCluster>) -> HubReconciler {
        let ports = HubPorts {
            modules: cluster.clone(),
            clusters: cluster.clone(),
            jobs: cluster.clone(),
            manifests: cluster.clone(),
            registry: cluster.clone(),
        };
        ReconcileDriver::new(HubHooks::new(Arc::new(OperatorConfig::default()), ports))
    }

    fn key() -> ObjectKey {
        ObjectKey::cluster_scoped("kmod")
    }

    #[test]
    fn test_claim_kernels_are_normalized() {
        let raw = vec!["5.15.0-2+".to_string(), "5.14.0-1".into(), "5.15.0-2".into(), "+".into()];
        let kernels: Vec<_> = claim_kernels(&raw).iter().map(|k| k.to_string()).collect();
        assert_eq!(kernels, vec!["5.14.0-1", "5.15.0-2"]);
    }

    #[tokio::test]
    async fn test_prebuilt_images_are_shipped() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_cluster("spoke-1", &[("env", "prod")], Some("5.14.0-1\n5.15.0-2"));
        cluster.add_cluster("spoke-2", &[("env", "prod")], None);
        cluster.add_cluster("spoke-3", &[("env", "dev")], Some("5.14.0-1"));
        cluster.add_hub_module(mcm(false));

        let outcome = reconciler(&cluster).reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);

        let manifests = cluster.manifests();
        assert_eq!(manifests.len(), 1);
        let manifest = &manifests[0];
        assert_eq!(manifest.namespace(), "spoke-1");
        assert_eq!(manifest.name(), "kmod");
        assert_eq!(manifest.label(MANAGED_CLUSTER_LABEL), Some("spoke-1"));

        let payload = &manifest.manifests[0];
        assert_eq!(payload["kind"], "Module");
        assert_eq!(payload["metadata"]["namespace"], "drivers");
        let mappings = payload["spec"]["kernelMappings"].as_array().unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0]["literal"], "5.14.0-1");
        assert_eq!(mappings[0]["containerImage"], "registry.local/kmod:5.14.0-1");
        assert!(payload["spec"]["build"].is_null());

        let status = cluster.hub_module("kmod").unwrap().status.unwrap();
        assert_eq!(status.number_desired, 2);
        assert_eq!(status.number_applied, 0);
    }

    #[tokio::test]
    async fn test_builds_run_in_hub_namespace_without_requeue() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_cluster("spoke-1", &[("env", "prod")], Some("5.14.0-1"));
        cluster.add_hub_module(mcm(true));
        let reconciler = reconciler(&cluster);

        let outcome = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert!(cluster.manifests().is_empty());

        let jobs = cluster.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].stage, StageKind::Build);
        assert_eq!(jobs[0].namespace(), OperatorConfig::default().hub_job_namespace);

        cluster.set_job_phase(jobs[0].namespace(), jobs[0].name(), JobPhase::Succeeded);
        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(cluster.manifests().len(), 1);
    }

    #[tokio::test]
    async fn test_deselected_cluster_loses_its_manifest() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_cluster("spoke-1", &[("env", "prod")], Some("5.14.0-1"));
        cluster.add_cluster("spoke-2", &[("env", "prod")], Some("5.14.0-1"));
        cluster.add_hub_module(mcm(false));
        let reconciler = reconciler(&cluster);

        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(cluster.manifests().len(), 2);

        cluster.add_cluster("spoke-2", &[("env", "dev")], Some("5.14.0-1"));
        reconciler.reconcile(&key()).await.unwrap();

        let remaining: Vec<_> = cluster
            .manifests()
            .iter()
            .map(|m| m.namespace().to_string())
            .collect();
        assert_eq!(remaining, vec!["spoke-1"]);
    }

    #[tokio::test]
    async fn test_status_counts_available_clusters() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_cluster("spoke-1", &[("env", "prod")], Some("5.14.0-1"));
        cluster.add_hub_module(mcm(false));
        let reconciler = reconciler(&cluster);

        reconciler.reconcile(&key()).await.unwrap();
        cluster.set_manifest_state("spoke-1", "kmod", true, true);
        reconciler.reconcile(&key()).await.unwrap();

        let status = cluster.hub_module("kmod").unwrap().status.unwrap();
        assert_eq!(status.number_applied, 1);
        assert_eq!(status.number_available, 1);
        assert_eq!(status.condition(CONDITION_READY).unwrap().status, "True");

        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(cluster.status_writes(), 2);
    }

    #[tokio::test]
    async fn test_spoke_module_with_same_name_keeps_hub_jobs() {
        use crate::crd::Module;
        use crate::reconcile::module::{ModuleHooks, ModulePorts};

        let cluster = Arc::new(InMemoryCluster::new());
        let config = Arc::new(OperatorConfig::default());
        cluster.add_cluster("spoke-1", &[("env", "prod")], Some("5.15.0-2"));
        cluster.add_hub_module(mcm(true));
        cluster.add_node("n1", "5.14.0-1", &[("role", "worker")]);

        let mut spoke_spec = mcm(true).spec.module_spec;
        spoke_spec.kernel_mappings[0].container_image =
            Some("registry.local/spoke:${KERNEL_FULL_VERSION}".into());
        let mut module = Module::new("kmod", spoke_spec);
        module.metadata.namespace = Some(config.hub_job_namespace.clone());
        module.metadata.uid = Some("uid-spoke".into());
        cluster.add_module(module);

        let spoke = ReconcileDriver::new(ModuleHooks::new(
            config.clone(),
            ModulePorts {
                modules: cluster.clone(),
                nodes: cluster.clone(),
                jobs: cluster.clone(),
                workloads: cluster.clone(),
                node_state: cluster.clone(),
                registry: cluster.clone(),
            },
        ));
        let hub = reconciler(&cluster);

        hub.reconcile(&key()).await.unwrap();
        let hub_job = cluster.jobs().remove(0);
        spoke
            .reconcile(&ObjectKey::namespaced(&config.hub_job_namespace, "kmod"))
            .await
            .unwrap();
        hub.reconcile(&key()).await.unwrap();

        let jobs = cluster.jobs();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().any(|j| j.meta.name == hub_job.meta.name));
        assert!(jobs.iter().any(|j| j.kernel_version() == Some("5.14.0-1")));
    }
}
