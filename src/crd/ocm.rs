//! Open Cluster Management types
//!
//! Minimal models of the `ManagedCluster` and `ManifestWork` resources; only
//! the fields the hub reconciler reads or writes are represented.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A spoke cluster registered with the hub.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    status = "ManagedClusterStatus",
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    #[serde(default)]
    pub hub_accepts_client: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    #[serde(default)]
    pub cluster_claims: Vec<ClusterClaim>,
}

/// A name/value fact reported by a spoke
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterClaim {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// A set of manifests the hub asks a spoke to apply. Lives in the namespace
/// named after the managed cluster.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "work.open-cluster-management.io",
    version = "v1",
    kind = "ManifestWork",
    plural = "manifestworks",
    status = "ManifestWorkStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkSpec {
    #[serde(default)]
    pub workload: ManifestsTemplate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ManifestsTemplate {
    #[serde(default)]
    pub manifests: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ManifestWorkStatus {
    #[serde(default)]
    pub conditions: Vec<WorkCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkCondition {
    pub r#type: String,
    pub status: String,
}

impl ManifestWork {
    /// Check a condition reported by the spoke work agent
    pub fn has_condition(&self, r#type: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.r#type == r#type && c.status == "True")
            })
            .unwrap_or(false)
    }
}
