//! Port adapters
//!
//! - [`kube`]: the cluster ports over the Kubernetes API
//! - [`registry`]: image lookups over the OCI distribution API
//! - [`memory`]: every port over in-process maps, for tests and benchmarks

pub mod kube;
pub mod memory;
pub mod registry;

pub use self::kube::KubeCluster;
pub use memory::InMemoryCluster;
pub use registry::RegistryClient;
