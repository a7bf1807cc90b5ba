//! Kernel Module Operator
//!
//! A Kubernetes operator that builds, signs and loads out-of-tree kernel
//! modules on the nodes that need them, and ships the same modules from a
//! hub to managed clusters.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Controllers (kube::runtime)                           │
//! │        Module (spoke)                    ManagedClusterModule (hub)          │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                            Reconcile Driver                                  │
//! │  fetch ─▶ resolve ─▶ orchestrate ─▶ project ─▶ status ─▶ gc ─▶ requeue       │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │ Kernel mapping  │  │  Build / Sign   │  │  Desired-state projection   │  │
//! │  │ resolution      │  │  job pipeline   │  │  loaders, node entries,     │  │
//! │  │ (+ pass cache)  │  │                 │  │  manifest works             │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                                 Ports                                        │
//! │  ObjectStore<Job|Workload|Manifest>  NodeInventory  ClusterInventory         │
//! │  NodeStateStore  ImageRegistry  ModuleStore  HubModuleStore                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                               Adapters                                       │
//! │  ┌───────────────────────┐  ┌──────────────────┐  ┌────────────────────────┐ │
//! │  │  Kubernetes API       │  │  OCI registry    │  │  In-memory (tests)     │ │
//! │  └───────────────────────┘  └──────────────────┘  └────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`kernel`]: kernel version normalization, mapping match and templating
//! - [`pipeline`]: build and sign job stages
//! - [`reconcile`]: reconciliation passes for Module and ManagedClusterModule
//! - [`adapters`]: port implementations
//! - [`controller`]: controller runtime wiring
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: derived objects and port traits
//! - [`error`]: Error types and handling

pub mod adapters;
pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod kernel;
pub mod labels;
pub mod metrics;
pub mod pipeline;
pub mod reconcile;

// Re-export commonly used types
pub use adapters::{InMemoryCluster, KubeCluster, RegistryClient};

pub use config::OperatorConfig;

pub use controller::{run_hub_controller, run_module_controller};

pub use crd::{
    KernelMapping, ManagedClusterModule, ManagedClusterModuleSpec, ManagedClusterModuleStatus,
    Module, ModuleSpec, ModuleStatus, NodeModulesConfig, NodeModulesConfigSpec,
};

pub use domain::{
    ApplyOutcome, DerivedObject, ExecutionJob, ObjectKey, RemoteManifest, Workload,
};

pub use error::{Error, ErrorAction, Result};

pub use kernel::{KernelVersion, MappingCache};

pub use reconcile::{HubReconciler, ModuleReconciler, ReconcileOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
