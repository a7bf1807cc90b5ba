//! Label and annotation keys shared by every derived object.
//!
//! These strings are the correlation contract between the reconciler and the
//! objects it manages: garbage collection and job lookup match them exactly.

use std::collections::BTreeMap;

/// Owning module name
pub const MODULE_NAME_LABEL: &str = "kmm.node.kubernetes.io/module.name";

/// Normalized kernel version the object was produced for
pub const TARGET_KERNEL_LABEL: &str = "kmm.node.kubernetes.io/target-kernel";

/// Pipeline stage of an execution job (`build` or `sign`)
pub const JOB_TYPE_LABEL: &str = "kmm.node.kubernetes.io/job-type";

/// Kind of the object a job was produced for (`Module` or `ManagedClusterModule`)
pub const OWNER_KIND_LABEL: &str = "kmm.node.kubernetes.io/owner-kind";

/// Role of a workload (`module-loader` or `device-plugin`)
pub const ROLE_LABEL: &str = "kmm.node.kubernetes.io/role";

/// Managed cluster a remote manifest is addressed to
pub const MANAGED_CLUSTER_LABEL: &str = "kmm.node.kubernetes.io/managed-cluster";

/// SHA-256 of the desired template, used for drift detection
pub const LAST_HASH_ANNOTATION: &str = "kmm.node.kubernetes.io/last-hash";

pub const ROLE_MODULE_LOADER: &str = "module-loader";
pub const ROLE_DEVICE_PLUGIN: &str = "device-plugin";

/// Name of the cluster claim listing a spoke's kernel versions
pub const KERNEL_VERSIONS_CLUSTER_CLAIM: &str = "kernel-versions.kmm.node.kubernetes.io";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kernel-module-operator";

/// Labels identifying every object owned by a module
pub fn module_selector(module: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(MODULE_NAME_LABEL.to_string(), module.to_string())])
}

/// Labels identifying the jobs of one owner.
///
/// A spoke Module and a hub ManagedClusterModule may share a name and a
/// namespace; only the owner kind tells their jobs apart.
pub fn owner_selector(owner_kind: &str, module: &str) -> BTreeMap<String, String> {
    let mut labels = module_selector(module);
    labels.insert(OWNER_KIND_LABEL.to_string(), owner_kind.to_string());
    labels
}

/// Labels for an object produced for one kernel version of a module
pub fn kernel_labels(module: &str, kernel_version: &str) -> BTreeMap<String, String> {
    let mut labels = module_selector(module);
    labels.insert(TARGET_KERNEL_LABEL.to_string(), kernel_version.to_string());
    labels
}

/// Render a label map as a Kubernetes equality selector string
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Check that every selector entry is present with the same value
pub fn matches_selector(
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_labels() {
        let labels = kernel_labels("kmod", "5.14.0-1");
        assert_eq!(labels.get(MODULE_NAME_LABEL).unwrap(), "kmod");
        assert_eq!(labels.get(TARGET_KERNEL_LABEL).unwrap(), "5.14.0-1");
    }

    #[test]
    fn test_owner_selector_narrows_module_selector() {
        let spoke = owner_selector("Module", "kmod");
        let hub = owner_selector("ManagedClusterModule", "kmod");
        assert!(matches_selector(&spoke, &module_selector("kmod")));
        assert!(!matches_selector(&spoke, &hub));
    }

    #[test]
    fn test_selector_string() {
        let labels = kernel_labels("kmod", "5.14.0-1");
        assert_eq!(
            selector_string(&labels),
            "kmm.node.kubernetes.io/module.name=kmod,kmm.node.kubernetes.io/target-kernel=5.14.0-1"
        );
    }

    #[test]
    fn test_matches_selector() {
        let labels = kernel_labels("kmod", "5.14.0-1");
        assert!(matches_selector(&labels, &module_selector("kmod")));
        assert!(!matches_selector(&labels, &module_selector("other")));
        assert!(matches_selector(&labels, &BTreeMap::new()));
    }
}
