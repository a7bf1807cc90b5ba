//! Projection of completed kernel versions into desired cluster state
//!
//! A kernel version whose image is ready gets one module-loader workload
//! pinned to nodes running that kernel, and every node of the group gets a
//! desired-module entry. Nothing is created for kernels still in the
//! pipeline; entries left on nodes that no longer have a ready kernel are
//! removed.

use super::selector::Selection;
use crate::config::OperatorConfig;
use crate::crd::{DevicePluginSpec, ModuleSpec, NodeModuleSpec};
use crate::domain::{
    content_hash, short_hash, ApplyOutcome, DerivedMeta, DerivedObject, ModuleRef,
    NodeStateStoreRef, OwnerRef, Workload, WorkloadSpec, WorkloadStatus, WorkloadStoreRef,
};
use crate::error::Result;
use crate::kernel::KernelVersion;
use crate::labels::{kernel_labels, module_selector, ROLE_DEVICE_PLUGIN, ROLE_LABEL, ROLE_MODULE_LOADER};
use crate::pipeline::Orchestration;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

const MAX_NAME: usize = 63;
const MODULES_DIR: &str = "/opt";

/// What the projector put in place during a pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    /// Kernel versions with a module-loader workload in place
    pub deployed: BTreeSet<KernelVersion>,
    /// Nodes that received a desired-module entry
    pub ready_targets: BTreeSet<String>,
}

/// Name of the module-loader workload for one kernel version
pub fn module_loader_name(module: &str, kernel: &KernelVersion) -> String {
    let suffix = format!("-{}", short_hash(kernel.as_str()));
    let prefix: String = module.chars().take(MAX_NAME - suffix.len()).collect();
    format!("{}{}", prefix.trim_end_matches(['-', '.']), suffix)
}

pub fn device_plugin_name(module: &str) -> String {
    format!("{}-device-plugin", module)
}

pub struct DesiredStateProjector {
    workloads: WorkloadStoreRef,
    node_state: NodeStateStoreRef,
    config: Arc<OperatorConfig>,
}

impl DesiredStateProjector {
    pub fn new(
        workloads: WorkloadStoreRef,
        node_state: NodeStateStoreRef,
        config: Arc<OperatorConfig>,
    ) -> Self {
        Self {
            workloads,
            node_state,
            config,
        }
    }

    /// Desired module-loader workload for a kernel version
    pub fn module_loader(
        &self,
        owner: &OwnerRef,
        module: &ModuleRef,
        spec: &ModuleSpec,
        kernel: &KernelVersion,
        image: &str,
    ) -> Result<Workload> {
        let mut labels = kernel_labels(&module.name, kernel.as_str());
        labels.insert(ROLE_LABEL.to_string(), ROLE_MODULE_LOADER.to_string());

        let mut node_selector = spec.selector.clone();
        node_selector.insert(self.config.kernel_label.clone(), kernel.to_string());

        let mut command = vec![
            "modprobe".to_string(),
            "-v".to_string(),
            "-d".to_string(),
            MODULES_DIR.to_string(),
            spec.module_name.clone(),
        ];
        command.extend(spec.module_parameters.iter().cloned());

        let workload_spec = WorkloadSpec {
            image: image.to_string(),
            command,
            args: vec![],
            pre_stop: vec![
                "modprobe".to_string(),
                "-r".to_string(),
                "-v".to_string(),
                "-d".to_string(),
                MODULES_DIR.to_string(),
                spec.module_name.clone(),
            ],
            node_selector,
            service_account: spec.service_account_name.clone(),
            image_pull_secret: spec.image_repo_secret.clone(),
            privileged: true,
        };
        let hash = content_hash(&workload_spec)?;

        Ok(Workload {
            meta: DerivedMeta::new(
                module_loader_name(&module.name, kernel),
                module.namespace.clone(),
                labels,
            )
            .with_owner(owner)
            .with_hash(hash),
            spec: workload_spec,
            status: WorkloadStatus::default(),
        })
    }

    /// Desired device-plugin workload
    pub fn device_plugin(
        &self,
        owner: &OwnerRef,
        module: &ModuleRef,
        spec: &ModuleSpec,
        plugin: &DevicePluginSpec,
    ) -> Result<Workload> {
        let mut labels = module_selector(&module.name);
        labels.insert(ROLE_LABEL.to_string(), ROLE_DEVICE_PLUGIN.to_string());

        let workload_spec = WorkloadSpec {
            image: plugin.image.clone(),
            command: vec![],
            args: plugin.args.clone(),
            pre_stop: vec![],
            node_selector: spec.selector.clone(),
            service_account: plugin.service_account_name.clone(),
            image_pull_secret: spec.image_repo_secret.clone(),
            privileged: true,
        };
        let hash = content_hash(&workload_spec)?;

        Ok(Workload {
            meta: DerivedMeta::new(
                device_plugin_name(&module.name),
                module.namespace.clone(),
                labels,
            )
            .with_owner(owner)
            .with_hash(hash),
            spec: workload_spec,
            status: WorkloadStatus::default(),
        })
    }

    #[instrument(skip_all, fields(module = %module.name, namespace = %module.namespace))]
    pub async fn project(
        &self,
        owner: &OwnerRef,
        module: &ModuleRef,
        spec: &ModuleSpec,
        selection: &Selection,
        outcomes: &BTreeMap<KernelVersion, Orchestration>,
    ) -> Result<Projection> {
        let mut projection = Projection::default();
        let mut entries: BTreeMap<String, NodeModuleSpec> = BTreeMap::new();

        for (kernel, group) in &selection.groups {
            let Some(Orchestration::Completed { image }) = outcomes.get(kernel) else {
                debug!(kernel_version = %kernel, "Image not ready; nothing to deploy");
                continue;
            };

            let workload = self.module_loader(owner, module, spec, kernel, image)?;
            let outcome = self.workloads.apply(&workload).await?;
            if outcome != ApplyOutcome::Unchanged {
                info!(
                    kernel_version = %kernel,
                    workload = %workload.name(),
                    "Module loader {}", outcome
                );
            }
            projection.deployed.insert(kernel.clone());

            for node in &group.targets {
                entries.insert(
                    node.clone(),
                    NodeModuleSpec {
                        name: module.name.clone(),
                        namespace: module.namespace.clone(),
                        kernel_version: kernel.to_string(),
                        container_image: image.clone(),
                        module_name: spec.module_name.clone(),
                        image_repo_secret: spec.image_repo_secret.clone(),
                    },
                );
            }
        }

        self.sync_node_entries(module, &entries).await?;
        self.sync_device_plugin(owner, module, spec).await?;

        projection.ready_targets = entries.into_keys().collect();
        Ok(projection)
    }

    async fn sync_node_entries(
        &self,
        module: &ModuleRef,
        desired: &BTreeMap<String, NodeModuleSpec>,
    ) -> Result<()> {
        for (node, entry) in desired {
            if self.node_state.set_entry(node, entry).await? {
                debug!(node = %node, kernel_version = %entry.kernel_version, "Updated desired module entry");
            }
        }

        let current = self
            .node_state
            .nodes_with_entry(&module.namespace, &module.name)
            .await?;
        for node in current.iter().filter(|n| !desired.contains_key(*n)) {
            if self
                .node_state
                .remove_entry(node, &module.namespace, &module.name)
                .await?
            {
                info!(node = %node, "Removed desired module entry");
            }
        }
        Ok(())
    }

    async fn sync_device_plugin(
        &self,
        owner: &OwnerRef,
        module: &ModuleRef,
        spec: &ModuleSpec,
    ) -> Result<()> {
        let desired = spec
            .device_plugin
            .as_ref()
            .map(|plugin| self.device_plugin(owner, module, spec, plugin))
            .transpose()?;

        if let Some(workload) = &desired {
            let outcome = self.workloads.apply(workload).await?;
            if outcome != ApplyOutcome::Unchanged {
                info!(workload = %workload.name(), "Device plugin {}", outcome);
            }
        }

        let mut selector = module_selector(&module.name);
        selector.insert(ROLE_LABEL.to_string(), ROLE_DEVICE_PLUGIN.to_string());
        let existing = self
            .workloads
            .list(Some(&module.namespace), &selector)
            .await?;
        for stale in existing
            .iter()
            .filter(|w| desired.as_ref().map(|d| d.name() != w.name()).unwrap_or(true))
        {
            self.workloads
                .delete(stale.namespace(), stale.name())
                .await?;
            info!(workload = %stale.name(), "Deleted device plugin");
        }
        Ok(())
    }
}
