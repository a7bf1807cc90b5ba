//! Module and ManagedClusterModule reads and status writes

use super::{map_kube_error, KubeCluster};
use crate::crd::{ManagedClusterModule, ManagedClusterModuleStatus, Module, ModuleStatus};
use crate::domain::{HubModuleStore, ModuleStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::json;

fn status_patch<S: serde::Serialize>(status: &S) -> Patch<serde_json::Value> {
    Patch::Merge(json!({ "status": status }))
}

#[async_trait]
impl ModuleStore for KubeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Module>> {
        let api: Api<Module> = Api::namespaced(self.client().clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_status(&self, module: &Module, status: &ModuleStatus) -> Result<()> {
        let namespace = module.namespace().ok_or_else(|| {
            Error::Internal(format!("module {} has no namespace", module.name_any()))
        })?;
        let api: Api<Module> = Api::namespaced(self.client().clone(), &namespace);
        api.patch_status(&module.name_any(), &PatchParams::default(), &status_patch(status))
            .await
            .map_err(|e| map_kube_error("Module", &module.name_any(), e))?;
        Ok(())
    }
}

#[async_trait]
impl HubModuleStore for KubeCluster {
    async fn get(&self, name: &str) -> Result<Option<ManagedClusterModule>> {
        let api: Api<ManagedClusterModule> = Api::all(self.client().clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update_status(
        &self,
        module: &ManagedClusterModule,
        status: &ManagedClusterModuleStatus,
    ) -> Result<()> {
        let api: Api<ManagedClusterModule> = Api::all(self.client().clone());
        api.patch_status(&module.name_any(), &PatchParams::default(), &status_patch(status))
            .await
            .map_err(|e| map_kube_error("ManagedClusterModule", &module.name_any(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_patch_wraps_status() {
        let status = ModuleStatus {
            observed_generation: Some(3),
            ..Default::default()
        };
        let Patch::Merge(body) = status_patch(&status) else {
            panic!("expected a merge patch");
        };
        assert_eq!(body["status"]["observedGeneration"], 3);
    }
}
