//! Node and managed cluster inventories

use super::{list_params, KubeCluster};
use crate::crd::ManagedCluster;
use crate::domain::{ClusterInfo, ClusterInventory, NodeInfo, NodeInventory};
use crate::error::Result;
use crate::labels::KERNEL_VERSIONS_CLUSTER_CLAIM;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use std::collections::BTreeMap;

fn node_info(node: &Node) -> NodeInfo {
    NodeInfo {
        name: node.metadata.name.clone().unwrap_or_default(),
        labels: node.metadata.labels.clone().unwrap_or_default(),
        kernel_version: node
            .status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .map(|i| i.kernel_version.clone())
            .unwrap_or_default(),
    }
}

fn cluster_info(cluster: &ManagedCluster) -> ClusterInfo {
    let claim = cluster
        .status
        .as_ref()
        .and_then(|s| {
            s.cluster_claims
                .iter()
                .find(|c| c.name == KERNEL_VERSIONS_CLUSTER_CLAIM)
        })
        .map(|c| c.value.as_str());

    ClusterInfo::from_claim(
        cluster.metadata.name.clone().unwrap_or_default(),
        cluster.metadata.labels.clone().unwrap_or_default(),
        claim,
    )
}

#[async_trait]
impl NodeInventory for KubeCluster {
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<NodeInfo>> {
        let api: Api<Node> = Api::all(self.client().clone());
        let nodes = api.list(&list_params(selector)).await?;
        Ok(nodes.items.iter().map(node_info).collect())
    }
}

#[async_trait]
impl ClusterInventory for KubeCluster {
    async fn list_clusters(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ClusterInfo>> {
        let api: Api<ManagedCluster> = Api::all(self.client().clone());
        let clusters = api.list(&list_params(selector)).await?;
        Ok(clusters.items.iter().map(cluster_info).collect())
    }
}
