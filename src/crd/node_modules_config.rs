//! NodeModulesConfig CRD
//!
//! One object per node, named after the node. The spec lists the modules the
//! node should run; the node agent reports what it actually loaded in status.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// NodeModulesConfig holds the desired kernel modules of a single node.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "NodeModulesConfig",
    plural = "nodemodulesconfigs",
    shortname = "nmc",
    status = "NodeModulesConfigStatus",
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct NodeModulesConfigSpec {
    /// Desired modules
    #[serde(default)]
    pub modules: Vec<NodeModuleSpec>,
}

/// Desired state of one module on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeModuleSpec {
    /// Owning Module name
    pub name: String,
    /// Owning Module namespace
    pub namespace: String,
    /// Kernel version the image was produced for
    pub kernel_version: String,
    /// Final image carrying the module
    pub container_image: String,
    /// Module to load
    pub module_name: String,
    /// Pull secret for the image
    #[serde(default)]
    pub image_repo_secret: Option<String>,
}

/// Modules the node agent reports as loaded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeModulesConfigStatus {
    #[serde(default)]
    pub modules: Vec<NodeModuleStatus>,
}

/// Observed state of one module on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeModuleStatus {
    pub name: String,
    pub namespace: String,
    pub kernel_version: String,
    pub container_image: String,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl NodeModulesConfigSpec {
    /// Insert or replace the entry for a module; returns true when changed
    pub fn upsert(&mut self, entry: NodeModuleSpec) -> bool {
        match self
            .modules
            .iter_mut()
            .find(|m| m.name == entry.name && m.namespace == entry.namespace)
        {
            Some(existing) if *existing == entry => false,
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                self.modules.push(entry);
                true
            }
        }
    }

    /// Remove the entry for a module; returns true when something was removed
    pub fn remove(&mut self, namespace: &str, name: &str) -> bool {
        let before = self.modules.len();
        self.modules
            .retain(|m| !(m.name == name && m.namespace == namespace));
        self.modules.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kernel: &str) -> NodeModuleSpec {
        NodeModuleSpec {
            name: "kmod".into(),
            namespace: "default".into(),
            kernel_version: kernel.into(),
            container_image: format!("registry.example.com/kmod:{}", kernel),
            module_name: "kmod".into(),
            image_repo_secret: None,
        }
    }

    #[test]
    fn test_upsert_and_remove() {
        let mut spec = NodeModulesConfigSpec::default();
        assert!(spec.upsert(entry("5.14.0-1")));
        assert!(!spec.upsert(entry("5.14.0-1")));
        assert!(spec.upsert(entry("5.14.0-2")));
        assert_eq!(spec.modules.len(), 1);
        assert_eq!(spec.modules[0].kernel_version, "5.14.0-2");

        assert!(spec.remove("default", "kmod"));
        assert!(!spec.remove("default", "kmod"));
        assert!(spec.modules.is_empty());
    }
}
