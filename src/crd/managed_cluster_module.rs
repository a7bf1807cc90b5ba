//! ManagedClusterModule CRD
//!
//! Hub-side counterpart of [`Module`](super::Module): the module spec is
//! built and signed on the hub, then shipped to every selected managed cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::module::{upsert_condition, ModuleCondition, ModuleSpec};

/// ManagedClusterModule deploys a Module to every managed cluster matching
/// its selector.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hub.kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "ManagedClusterModule",
    plural = "managedclustermodules",
    shortname = "mcm",
    status = "ManagedClusterModuleStatus",
    printcolumn = r#"{"name": "Desired", "type": "integer", "jsonPath": ".status.numberDesired"}"#,
    printcolumn = r#"{"name": "Applied", "type": "integer", "jsonPath": ".status.numberApplied"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterModuleSpec {
    /// Module to create on the spokes
    pub module_spec: ModuleSpec,

    /// Namespace of the Module on the spokes
    pub spoke_namespace: String,

    /// Managed cluster label selector
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

/// Status of the ManagedClusterModule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterModuleStatus {
    /// Clusters matching the selector
    #[serde(default)]
    pub number_desired: u32,

    /// Clusters with an applied ManifestWork
    #[serde(default)]
    pub number_applied: u32,

    /// Clusters reporting the ManifestWork as available
    #[serde(default)]
    pub number_available: u32,

    #[serde(default)]
    pub conditions: Vec<ModuleCondition>,
}

impl ManagedClusterModule {
    /// Get the module name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }
}

impl ManagedClusterModuleStatus {
    pub fn set_condition(&mut self, condition: ModuleCondition) {
        upsert_condition(&mut self.conditions, condition);
    }

    pub fn condition(&self, r#type: &str) -> Option<&ModuleCondition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }
}
