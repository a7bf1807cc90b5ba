//! Domain Ports - Capability traits the reconciliation core depends on
//!
//! These traits define the boundary between the core and the cluster API.
//! The core never talks to a concrete client: adapters implement these traits
//! against Kubernetes (see [`crate::adapters::kube`]) or in memory
//! (see [`crate::adapters::memory`]).

use crate::crd::{ManagedClusterModule, ManagedClusterModuleStatus, Module, ModuleStatus, NodeModuleSpec};
use crate::domain::objects::{
    ApplyOutcome, ClusterInfo, DerivedObject, ExecutionJob, NodeInfo, RemoteManifest, Workload,
};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Derived Object Store Port
// =============================================================================

/// List / create-or-patch / delete over one kind of derived object
#[async_trait]
pub trait ObjectStore<T: DerivedObject>: Send + Sync {
    /// List objects carrying every label of `selector`; `None` lists all namespaces
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<T>>;

    /// Create the object, or patch it when its desired hash changed
    async fn apply(&self, object: &T) -> Result<ApplyOutcome>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

// =============================================================================
// Inventory Ports
// =============================================================================

/// Port listing the nodes of the cluster
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// List nodes carrying every label of `selector`
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<NodeInfo>>;
}

/// Port listing the managed clusters of a hub
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    /// List managed clusters carrying every label of `selector`
    async fn list_clusters(&self, selector: &BTreeMap<String, String>)
        -> Result<Vec<ClusterInfo>>;
}

// =============================================================================
// Desired Node State Port
// =============================================================================

/// Port for per-node desired-module records
#[async_trait]
pub trait NodeStateStore: Send + Sync {
    /// Insert or replace a module entry on a node; returns true when changed
    async fn set_entry(&self, node: &str, entry: &NodeModuleSpec) -> Result<bool>;

    /// Remove a module entry from a node; returns true when something was removed
    async fn remove_entry(&self, node: &str, namespace: &str, name: &str) -> Result<bool>;

    /// Nodes currently holding an entry for the module
    async fn nodes_with_entry(&self, namespace: &str, name: &str) -> Result<Vec<String>>;
}

// =============================================================================
// Image Registry Port
// =============================================================================

/// Port answering whether an image already exists
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;
}

// =============================================================================
// Top-level Object Ports
// =============================================================================

/// Port for Module reads and status writes
#[async_trait]
pub trait ModuleStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Module>>;

    async fn update_status(&self, module: &Module, status: &ModuleStatus) -> Result<()>;
}

/// Port for ManagedClusterModule reads and status writes
#[async_trait]
pub trait HubModuleStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ManagedClusterModule>>;

    async fn update_status(
        &self,
        module: &ManagedClusterModule,
        status: &ManagedClusterModuleStatus,
    ) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type JobStoreRef = Arc<dyn ObjectStore<ExecutionJob>>;
pub type WorkloadStoreRef = Arc<dyn ObjectStore<Workload>>;
pub type ManifestStoreRef = Arc<dyn ObjectStore<RemoteManifest>>;
pub type NodeInventoryRef = Arc<dyn NodeInventory>;
pub type ClusterInventoryRef = Arc<dyn ClusterInventory>;
pub type NodeStateStoreRef = Arc<dyn NodeStateStore>;
pub type ImageRegistryRef = Arc<dyn ImageRegistry>;
pub type ModuleStoreRef = Arc<dyn ModuleStore>;
pub type HubModuleStoreRef = Arc<dyn HubModuleStore>;
