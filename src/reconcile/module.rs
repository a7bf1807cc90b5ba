//! Module reconciliation hooks
//!
//! Spoke-side pass: nodes are the targets, execution jobs build and sign the
//! images in the module's namespace, and one module-loader workload per
//! kernel version loads the module.

use super::driver::{ReconcileDriver, ReconcileHooks};
use super::gc::{GarbageCollector, GcReport};
use super::projector::{DesiredStateProjector, Projection};
use super::selector::{NodeModuleSelector, Selection};
use super::status::module_status;
use crate::config::OperatorConfig;
use crate::crd::Module;
use crate::domain::{
    ImageRegistryRef, JobStoreRef, ModuleRef, ModuleStoreRef, NodeInventoryRef, NodeStateStoreRef,
    ObjectKey, OwnerRef, WorkloadStoreRef,
};
use crate::error::{Error, Result};
use crate::kernel::{KernelVersion, MappingCache};
use crate::labels::module_selector;
use crate::metrics;
use crate::pipeline::{BuildSignOrchestrator, JobStage, Orchestration};
use async_trait::async_trait;
use chrono::Utc;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Ports the Module pass depends on
#[derive(Clone)]
pub struct ModulePorts {
    pub modules: ModuleStoreRef,
    pub nodes: NodeInventoryRef,
    pub jobs: JobStoreRef,
    pub workloads: WorkloadStoreRef,
    pub node_state: NodeStateStoreRef,
    pub registry: ImageRegistryRef,
}

/// Targets of one Module pass
#[derive(Debug)]
pub struct ModuleTargets {
    pub module: ModuleRef,
    pub owner: OwnerRef,
    pub selection: Selection,
    /// Mapping resolutions performed during the pass
    pub resolutions: usize,
}

/// Owner reference pointing at a top-level object
pub(crate) fn owner_ref<K>(object: &K) -> Result<OwnerRef>
where
    K: Resource<DynamicType = ()>,
{
    let meta = object.meta();
    let name = meta.name.clone().unwrap_or_default();
    let uid = meta.uid.clone().ok_or_else(|| {
        Error::Internal(format!("{} {} has no uid", K::kind(&()), name))
    })?;
    Ok(OwnerRef {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name,
        uid,
    })
}

pub struct ModuleHooks {
    config: Arc<OperatorConfig>,
    modules: ModuleStoreRef,
    workloads: WorkloadStoreRef,
    node_state: NodeStateStoreRef,
    selector: NodeModuleSelector,
    orchestrator: BuildSignOrchestrator,
    projector: DesiredStateProjector,
    gc: GarbageCollector,
}

impl ModuleHooks {
    pub fn new(config: Arc<OperatorConfig>, ports: ModulePorts) -> Self {
        let build = JobStage::build(ports.jobs.clone(), ports.registry.clone(), config.clone());
        let sign = JobStage::sign(ports.jobs.clone(), ports.registry.clone(), config.clone());

        Self {
            selector: NodeModuleSelector::new(ports.nodes),
            orchestrator: BuildSignOrchestrator::new(Arc::new(build), Arc::new(sign)),
            projector: DesiredStateProjector::new(
                ports.workloads.clone(),
                ports.node_state.clone(),
                config.clone(),
            ),
            gc: GarbageCollector::for_spoke(
                ports.jobs,
                ports.workloads.clone(),
                config.job_retention(),
            ),
            modules: ports.modules,
            workloads: ports.workloads,
            node_state: ports.node_state,
            config,
        }
    }

    /// Remove every desired-module entry of a deleted module.
    ///
    /// Jobs and workloads carry an owner reference and are removed by the
    /// API server; node entries live in shared per-node objects and are not.
    pub async fn cleanup(&self, module: &Module) -> Result<()> {
        let namespace = module.namespace_or_default();
        let nodes = self
            .node_state
            .nodes_with_entry(namespace, module.name())
            .await?;
        for node in &nodes {
            self.node_state
                .remove_entry(node, namespace, module.name())
                .await?;
        }
        metrics::UNRESOLVED_KERNELS
            .with_label_values(&[namespace, module.name()])
            .set(0);
        info!(module = module.name(), namespace, nodes = nodes.len(), "Cleaned up module");
        Ok(())
    }
}

#[async_trait]
impl ReconcileHooks for ModuleHooks {
    type Object = Module;
    type Targets = ModuleTargets;
    type Outcomes = BTreeMap<KernelVersion, Orchestration>;
    type Projection = Projection;

    fn controller(&self) -> &'static str {
        "module"
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Option<Module>> {
        let namespace = key.namespace.as_deref().ok_or_else(|| {
            Error::Internal(format!("Module key {} has no namespace", key))
        })?;
        self.modules.get(namespace, &key.name).await
    }

    async fn resolve(&self, module: &Module) -> Result<ModuleTargets> {
        let module_ref = ModuleRef::new(module.name(), module.namespace_or_default());
        let owner = owner_ref(module)?;

        let mut cache = MappingCache::new();
        let selection = self
            .selector
            .select(&module_ref, &module.spec, &mut cache)
            .await?;

        metrics::UNRESOLVED_KERNELS
            .with_label_values(&[module_ref.namespace.as_str(), module_ref.name.as_str()])
            .set(i64::try_from(selection.unresolved().len()).unwrap_or(i64::MAX));

        Ok(ModuleTargets {
            module: module_ref,
            owner,
            selection,
            resolutions: cache.resolutions(),
        })
    }

    async fn orchestrate(&self, targets: &ModuleTargets) -> Result<Self::Outcomes> {
        self.orchestrator
            .run_all(&targets.owner, targets.selection.mappings())
            .await
    }

    async fn project(
        &self,
        module: &Module,
        targets: &ModuleTargets,
        outcomes: &Self::Outcomes,
    ) -> Result<Projection> {
        self.projector
            .project(
                &targets.owner,
                &targets.module,
                &module.spec,
                &targets.selection,
                outcomes,
            )
            .await
    }

    async fn aggregate(
        &self,
        module: &Module,
        targets: &ModuleTargets,
        outcomes: &Self::Outcomes,
        projection: &Projection,
    ) -> Result<()> {
        let workloads = self
            .workloads
            .list(
                Some(&targets.module.namespace),
                &module_selector(&targets.module.name),
            )
            .await?;

        let status = module_status(
            module.status.as_ref(),
            module.metadata.generation,
            &targets.selection,
            outcomes,
            projection,
            &workloads,
        );
        if module.status.as_ref() == Some(&status) {
            debug!("Status unchanged");
            return Ok(());
        }
        self.modules.update_status(module, &status).await
    }

    async fn collect_garbage(&self, targets: &ModuleTargets) -> GcReport {
        self.gc
            .collect(&targets.module, &targets.selection.scope(), Utc::now())
            .await
    }

    fn requeue_after(&self, outcomes: &Self::Outcomes) -> Option<Duration> {
        outcomes
            .values()
            .any(Orchestration::is_in_progress)
            .then(|| self.config.in_progress_requeue())
    }
}

/// Reconciler for spoke Modules
pub type ModuleReconciler = ReconcileDriver<ModuleHooks>;
