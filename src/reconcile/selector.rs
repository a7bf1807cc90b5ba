//! Target selection and grouping by kernel version

use super::gc::GcScope;
use crate::crd::ModuleSpec;
use crate::domain::{ModuleRef, NodeInventoryRef};
use crate::error::Result;
use crate::kernel::{
    resolve_kernel, KernelVersion, MappingCache, OsConfig, ResolutionFailure, ResolvedMapping,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Targets (nodes or clusters) sharing one kernel version
#[derive(Debug, Clone)]
pub struct KernelGroup {
    pub mapping: Arc<ResolvedMapping>,
    pub targets: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingKernelVersion,
    Unresolved(ResolutionFailure),
}

/// A target left out of this pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTarget {
    pub target: String,
    pub kernel_version: Option<KernelVersion>,
    pub reason: SkipReason,
}

/// Result of grouping the targets of one pass
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub groups: BTreeMap<KernelVersion, KernelGroup>,
    pub skipped: Vec<SkippedTarget>,
    /// Targets matching the selector, resolved or not
    pub candidates: usize,
}

impl Selection {
    /// Resolve `raw_kernel` through the cache and file `target` under it
    pub fn record<F>(&mut self, cache: &mut MappingCache, target: &str, raw_kernel: &str, resolve: F)
    where
        F: FnOnce(&KernelVersion) -> Result<ResolvedMapping>,
    {
        let kernel = KernelVersion::normalize(raw_kernel);
        if kernel.is_empty() {
            warn!(target, "Target reports no kernel version; skipping");
            self.skipped.push(SkippedTarget {
                target: target.to_string(),
                kernel_version: None,
                reason: SkipReason::MissingKernelVersion,
            });
            return;
        }

        match cache.get_or_resolve(&kernel, resolve) {
            Ok(mapping) => {
                self.groups
                    .entry(kernel)
                    .or_insert_with(|| KernelGroup {
                        mapping,
                        targets: BTreeSet::new(),
                    })
                    .targets
                    .insert(target.to_string());
            }
            Err(failure) => {
                warn!(
                    target,
                    kernel_version = %kernel,
                    reason = failure.reason(),
                    "Skipping target: {}",
                    failure
                );
                self.skipped.push(SkippedTarget {
                    target: target.to_string(),
                    kernel_version: Some(kernel),
                    reason: SkipReason::Unresolved(failure),
                });
            }
        }
    }

    /// Kernel versions still in use, for garbage collection
    pub fn scope(&self) -> GcScope {
        GcScope::new(self.groups.keys().map(|k| k.to_string()))
    }

    /// Targets that resolved to a mapping
    pub fn desired_targets(&self) -> usize {
        self.groups.values().map(|g| g.targets.len()).sum()
    }

    /// Distinct unresolved kernel versions with their failure
    pub fn unresolved(&self) -> BTreeMap<&KernelVersion, &ResolutionFailure> {
        self.skipped
            .iter()
            .filter_map(|s| match (&s.kernel_version, &s.reason) {
                (Some(k), SkipReason::Unresolved(f)) => Some((k, f)),
                _ => None,
            })
            .collect()
    }

    pub fn mappings(&self) -> impl Iterator<Item = &Arc<ResolvedMapping>> {
        self.groups.values().map(|g| &g.mapping)
    }
}

/// Lists the nodes selected by a module and groups them by kernel version
pub struct NodeModuleSelector {
    nodes: NodeInventoryRef,
}

impl NodeModuleSelector {
    pub fn new(nodes: NodeInventoryRef) -> Self {
        Self { nodes }
    }

    #[instrument(skip_all, fields(module = %module.name, namespace = %module.namespace))]
    pub async fn select(
        &self,
        module: &ModuleRef,
        spec: &ModuleSpec,
        cache: &mut MappingCache,
    ) -> Result<Selection> {
        let nodes = self.nodes.list_nodes(&spec.selector).await?;
        let mut selection = Selection {
            candidates: nodes.len(),
            ..Default::default()
        };

        for node in &nodes {
            let os = OsConfig::from_node_labels(&node.labels);
            selection.record(cache, &node.name, &node.kernel_version, |kernel| {
                resolve_kernel(module, spec, kernel, &os)
            });
        }

        debug!(
            nodes = nodes.len(),
            kernels = selection.groups.len(),
            skipped = selection.skipped.len(),
            "Grouped nodes by kernel version"
        );
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryCluster;
    use crate::crd::KernelMapping;

    fn spec() -> ModuleSpec {
        ModuleSpec {
            selector: BTreeMap::from([("role".to_string(), "worker".to_string())]),
            module_name: "kmm_ci_a".into(),
            module_parameters: vec![],
            container_image: None,
            build: None,
            sign: None,
            kernel_mappings: vec![KernelMapping {
                regexp: Some(r"^5\.".into()),
                container_image: Some("img:${KERNEL_FULL_VERSION}".into()),
                ..Default::default()
            }],
            device_plugin: None,
            image_repo_secret: None,
            service_account_name: None,
        }
    }

    #[tokio::test]
    async fn test_groups_nodes_and_resolves_once_per_kernel() {
        let cluster = Arc::new(InMemoryCluster::new());
        for (i, kernel) in ["5.14.0-1", "5.14.0-1+", "5.14.0-1", "5.15.0-2", "5.15.0-2"]
            .iter()
            .enumerate()
        {
            cluster.add_node(&format!("n{}", i), kernel, &[("role", "worker")]);
        }
        cluster.add_node("other", "5.14.0-1", &[("role", "infra")]);

        let selector = NodeModuleSelector::new(cluster.clone());
        let mut cache = MappingCache::new();
        let selection = selector
            .select(&ModuleRef::new("kmod", "drivers"), &spec(), &mut cache)
            .await
            .unwrap();

        assert_eq!(selection.candidates, 5);
        assert_eq!(selection.groups.len(), 2);
        assert_eq!(cache.resolutions(), 2);
        assert_eq!(selection.desired_targets(), 5);

        let group = &selection.groups[&KernelVersion::normalize("5.14.0-1")];
        assert_eq!(group.targets.len(), 3);
        assert_eq!(group.mapping.container_image, "img:5.14.0-1");
    }

    #[tokio::test]
    async fn test_skips_unresolvable_nodes() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_node("good", "5.14.0-1", &[("role", "worker")]);
        cluster.add_node("rc", "6.0.0-rc1", &[("role", "worker")]);
        cluster.add_node("blank", "", &[("role", "worker")]);

        let selector = NodeModuleSelector::new(cluster.clone());
        let mut cache = MappingCache::new();
        let selection = selector
            .select(&ModuleRef::new("kmod", "drivers"), &spec(), &mut cache)
            .await
            .unwrap();

        assert_eq!(selection.groups.len(), 1);
        assert_eq!(selection.skipped.len(), 2);
        let unresolved = selection.unresolved();
        assert_eq!(
            unresolved.get(&KernelVersion::normalize("6.0.0-rc1")),
            Some(&&ResolutionFailure::NoMatchingMapping)
        );
        assert!(selection
            .skipped
            .iter()
            .any(|s| s.target == "blank" && s.reason == SkipReason::MissingKernelVersion));
        assert_eq!(selection.scope(), GcScope::new(["5.14.0-1"]));
    }
}
