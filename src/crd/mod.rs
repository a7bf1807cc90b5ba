//! Custom Resource Definitions for the Kernel Module Operator
//!
//! This module contains all CRD types:
//! - Module: kernel module to build, sign and load on matching nodes
//! - NodeModulesConfig: per-node desired modules consumed by the node agent
//! - ManagedClusterModule: hub-side module shipped to managed clusters
//! - ManagedCluster / ManifestWork: external Open Cluster Management types

pub mod managed_cluster_module;
pub mod module;
pub mod node_modules_config;
pub mod ocm;

pub use managed_cluster_module::*;
pub use module::*;
pub use node_modules_config::*;
pub use ocm::*;
