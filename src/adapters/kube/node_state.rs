//! Per-node desired state as NodeModulesConfig objects

use super::{map_kube_error, KubeCluster};
use crate::crd::{NodeModuleSpec, NodeModulesConfig, NodeModulesConfigSpec};
use crate::domain::NodeStateStore;
use crate::error::Result;
use async_trait::async_trait;
use kube::api::{ListParams, PostParams};
use kube::Api;
use tracing::debug;

const KIND: &str = "NodeModulesConfig";

impl KubeCluster {
    fn node_configs(&self) -> Api<NodeModulesConfig> {
        Api::all(self.client().clone())
    }
}

#[async_trait]
impl NodeStateStore for KubeCluster {
    async fn set_entry(&self, node: &str, entry: &NodeModuleSpec) -> Result<bool> {
        let api = self.node_configs();
        let params = PostParams::default();

        match api.get_opt(node).await? {
            None => {
                let config = NodeModulesConfig::new(
                    node,
                    NodeModulesConfigSpec {
                        modules: vec![entry.clone()],
                    },
                );
                api.create(&params, &config)
                    .await
                    .map_err(|e| map_kube_error(KIND, node, e))?;
                debug!(node, module = %entry.name, "Created node modules config");
                Ok(true)
            }
            Some(mut config) => {
                if !config.spec.upsert(entry.clone()) {
                    return Ok(false);
                }
                api.replace(node, &params, &config)
                    .await
                    .map_err(|e| map_kube_error(KIND, node, e))?;
                Ok(true)
            }
        }
    }

    async fn remove_entry(&self, node: &str, namespace: &str, name: &str) -> Result<bool> {
        let api = self.node_configs();
        let Some(mut config) = api.get_opt(node).await? else {
            return Ok(false);
        };
        if !config.spec.remove(namespace, name) {
            return Ok(false);
        }
        api.replace(node, &PostParams::default(), &config)
            .await
            .map_err(|e| map_kube_error(KIND, node, e))?;
        Ok(true)
    }

    async fn nodes_with_entry(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        let configs = self.node_configs().list(&ListParams::default()).await?;
        Ok(configs
            .items
            .into_iter()
            .filter(|c| {
                c.spec
                    .modules
                    .iter()
                    .any(|m| m.name == name && m.namespace == namespace)
            })
            .filter_map(|c| c.metadata.name)
            .collect())
    }
}
