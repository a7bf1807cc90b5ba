//! In-memory adapter
//!
//! Implements every port over process-local maps. Used by the unit tests and
//! the benchmarks. Unchanged hashes and missing objects behave as in the
//! Kubernetes adapter.

use crate::crd::{
    ManagedClusterModule, ManagedClusterModuleStatus, Module, ModuleStatus, NodeModuleSpec,
    NodeModulesConfigSpec,
};
use crate::domain::{
    ApplyOutcome, ClusterInfo, ClusterInventory, DerivedObject, ExecutionJob, HubModuleStore,
    ImageRegistry, JobPhase, ModuleStore, NodeInfo, NodeInventory, NodeStateStore, ObjectStore,
    RemoteManifest, Workload,
};
use crate::error::{Error, Result};
use crate::labels::matches_selector;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// One kind of derived object, keyed by (namespace, name)
struct Table<T> {
    objects: DashMap<Key, T>,
}

impl<T: DerivedObject> Table<T> {
    fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    fn list(&self, namespace: Option<&str>, selector: &BTreeMap<String, String>) -> Vec<T> {
        let mut found: Vec<T> = self
            .objects
            .iter()
            .filter(|entry| namespace.map(|ns| entry.key().0 == ns).unwrap_or(true))
            .filter(|entry| matches_selector(entry.value().labels(), selector))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| (a.namespace(), a.name()).cmp(&(b.namespace(), b.name())));
        found
    }

    fn apply(&self, object: &T) -> ApplyOutcome {
        let id = key(object.namespace(), object.name());
        let existing = self.objects.get(&id).map(|e| e.value().clone());

        match existing {
            Some(current) if current.desired_hash().is_some()
                && current.desired_hash() == object.desired_hash() =>
            {
                ApplyOutcome::Unchanged
            }
            Some(current) => {
                let mut patched = object.clone();
                patched.merge_observed(&current);
                self.objects.insert(id, patched);
                ApplyOutcome::Patched
            }
            None => {
                let mut created = object.clone();
                created.meta_mut().created_at.get_or_insert_with(Utc::now);
                self.objects.insert(id, created);
                ApplyOutcome::Created
            }
        }
    }

    fn insert(&self, object: T) {
        self.objects
            .insert(key(object.namespace(), object.name()), object);
    }

    fn remove(&self, namespace: &str, name: &str) {
        self.objects.remove(&key(namespace, name));
    }

    fn update<F: FnOnce(&mut T)>(&self, namespace: &str, name: &str, f: F) {
        if let Some(mut entry) = self.objects.get_mut(&key(namespace, name)) {
            f(entry.value_mut());
        }
    }

    fn all(&self) -> Vec<T> {
        self.list(None, &BTreeMap::new())
    }
}

/// A whole cluster (or hub) held in memory
pub struct InMemoryCluster {
    nodes: RwLock<BTreeMap<String, NodeInfo>>,
    clusters: RwLock<BTreeMap<String, ClusterInfo>>,
    jobs: Table<ExecutionJob>,
    workloads: Table<Workload>,
    manifests: Table<RemoteManifest>,
    node_state: DashMap<String, NodeModulesConfigSpec>,
    modules: DashMap<Key, Module>,
    hub_modules: DashMap<String, ManagedClusterModule>,
    images: RwLock<HashSet<String>>,
    registry_down: AtomicBool,
    failing_deletes: RwLock<HashSet<String>>,
    status_writes: AtomicUsize,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            clusters: RwLock::new(BTreeMap::new()),
            jobs: Table::new(),
            workloads: Table::new(),
            manifests: Table::new(),
            node_state: DashMap::new(),
            modules: DashMap::new(),
            hub_modules: DashMap::new(),
            images: RwLock::new(HashSet::new()),
            registry_down: AtomicBool::new(false),
            failing_deletes: RwLock::new(HashSet::new()),
            status_writes: AtomicUsize::new(0),
        }
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Add or replace a node
    pub fn add_node(&self, name: &str, kernel_version: &str, labels: &[(&str, &str)]) {
        let node = NodeInfo {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            kernel_version: kernel_version.to_string(),
        };
        self.nodes.write().insert(name.to_string(), node);
    }

    pub fn remove_node(&self, name: &str) {
        self.nodes.write().remove(name);
    }

    /// Add or replace a managed cluster; `claim` is the raw kernel-versions claim
    pub fn add_cluster(&self, name: &str, labels: &[(&str, &str)], claim: Option<&str>) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.clusters
            .write()
            .insert(name.to_string(), ClusterInfo::from_claim(name, labels, claim));
    }

    pub fn remove_cluster(&self, name: &str) {
        self.clusters.write().remove(name);
    }

    // =========================================================================
    // Registry
    // =========================================================================

    pub fn push_image(&self, image: &str) {
        self.images.write().insert(image.to_string());
    }

    /// Make every registry lookup fail
    pub fn fail_registry(&self, down: bool) {
        self.registry_down.store(down, Ordering::SeqCst);
    }

    // =========================================================================
    // Derived objects
    // =========================================================================

    pub fn jobs(&self) -> Vec<ExecutionJob> {
        self.jobs.all()
    }

    pub fn insert_job(&self, job: ExecutionJob) {
        self.jobs.insert(job);
    }

    /// Simulate the job controller moving a job to `phase`
    pub fn set_job_phase(&self, namespace: &str, name: &str, phase: JobPhase) {
        self.jobs.update(namespace, name, |job| {
            job.completed_at = phase.is_terminal().then(Utc::now);
            job.phase = phase;
        });
    }

    pub fn workloads(&self) -> Vec<Workload> {
        self.workloads.all()
    }

    pub fn insert_workload(&self, workload: Workload) {
        self.workloads.insert(workload);
    }

    /// Simulate pods becoming available on `available` nodes
    pub fn set_workload_available(&self, namespace: &str, name: &str, available: u32) {
        self.workloads.update(namespace, name, |w| {
            w.status.desired = available;
            w.status.ready = available;
            w.status.available = available;
        });
    }

    pub fn manifests(&self) -> Vec<RemoteManifest> {
        self.manifests.all()
    }

    pub fn insert_manifest(&self, manifest: RemoteManifest) {
        self.manifests.insert(manifest);
    }

    /// Simulate the spoke work agent reporting on a manifest
    pub fn set_manifest_state(&self, namespace: &str, name: &str, applied: bool, available: bool) {
        self.manifests.update(namespace, name, |m| {
            m.applied = applied;
            m.available = available;
        });
    }

    /// Make deletes of objects named `name` fail, whatever their kind
    pub fn fail_deletes_of(&self, name: &str) {
        self.failing_deletes.write().insert(name.to_string());
    }

    fn check_delete(&self, name: &str) -> Result<()> {
        if self.failing_deletes.read().contains(name) {
            return Err(Error::StoreUnavailable(format!("delete of {} refused", name)));
        }
        Ok(())
    }

    // =========================================================================
    // Node state
    // =========================================================================

    pub fn node_entries(&self, node: &str) -> Vec<NodeModuleSpec> {
        self.node_state
            .get(node)
            .map(|spec| spec.modules.clone())
            .unwrap_or_default()
    }

    // =========================================================================
    // Top-level objects
    // =========================================================================

    pub fn add_module(&self, module: Module) {
        let id = key(module.namespace_or_default(), module.name());
        self.modules.insert(id, module);
    }

    pub fn remove_module(&self, namespace: &str, name: &str) {
        self.modules.remove(&key(namespace, name));
    }

    pub fn module(&self, namespace: &str, name: &str) -> Option<Module> {
        self.modules
            .get(&key(namespace, name))
            .map(|m| m.value().clone())
    }

    pub fn add_hub_module(&self, module: ManagedClusterModule) {
        self.hub_modules.insert(module.name().to_string(), module);
    }

    pub fn hub_module(&self, name: &str) -> Option<ManagedClusterModule> {
        self.hub_modules.get(name).map(|m| m.value().clone())
    }

    /// Number of status writes performed so far
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore<ExecutionJob> for InMemoryCluster {
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ExecutionJob>> {
        Ok(self.jobs.list(namespace, selector))
    }

    async fn apply(&self, object: &ExecutionJob) -> Result<ApplyOutcome> {
        Ok(self.jobs.apply(object))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.check_delete(name)?;
        self.jobs.remove(namespace, name);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore<Workload> for InMemoryCluster {
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Workload>> {
        Ok(self.workloads.list(namespace, selector))
    }

    async fn apply(&self, object: &Workload) -> Result<ApplyOutcome> {
        Ok(self.workloads.apply(object))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.check_delete(name)?;
        self.workloads.remove(namespace, name);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore<RemoteManifest> for InMemoryCluster {
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<RemoteManifest>> {
        Ok(self.manifests.list(namespace, selector))
    }

    async fn apply(&self, object: &RemoteManifest) -> Result<ApplyOutcome> {
        Ok(self.manifests.apply(object))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.check_delete(name)?;
        self.manifests.remove(namespace, name);
        Ok(())
    }
}

#[async_trait]
impl NodeInventory for InMemoryCluster {
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<NodeInfo>> {
        Ok(self
            .nodes
            .read()
            .values()
            .filter(|n| matches_selector(&n.labels, selector))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ClusterInventory for InMemoryCluster {
    async fn list_clusters(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ClusterInfo>> {
        Ok(self
            .clusters
            .read()
            .values()
            .filter(|c| matches_selector(&c.labels, selector))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NodeStateStore for InMemoryCluster {
    async fn set_entry(&self, node: &str, entry: &NodeModuleSpec) -> Result<bool> {
        Ok(self
            .node_state
            .entry(node.to_string())
            .or_default()
            .upsert(entry.clone()))
    }

    async fn remove_entry(&self, node: &str, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .node_state
            .get_mut(node)
            .map(|mut spec| spec.remove(namespace, name))
            .unwrap_or(false))
    }

    async fn nodes_with_entry(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        let mut nodes: Vec<String> = self
            .node_state
            .iter()
            .filter(|e| {
                e.value()
                    .modules
                    .iter()
                    .any(|m| m.namespace == namespace && m.name == name)
            })
            .map(|e| e.key().clone())
            .collect();
        nodes.sort();
        Ok(nodes)
    }
}

#[async_trait]
impl ImageRegistry for InMemoryCluster {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        if self.registry_down.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("registry unreachable".into()));
        }
        Ok(self.images.read().contains(image))
    }
}

#[async_trait]
impl ModuleStore for InMemoryCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Module>> {
        Ok(self.module(namespace, name))
    }

    async fn update_status(&self, module: &Module, status: &ModuleStatus) -> Result<()> {
        let id = key(module.namespace_or_default(), module.name());
        let mut stored = self.modules.get_mut(&id).ok_or_else(|| Error::ResourceNotFound {
            kind: "Module".into(),
            name: module.name().to_string(),
        })?;
        stored.status = Some(status.clone());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl HubModuleStore for InMemoryCluster {
    async fn get(&self, name: &str) -> Result<Option<ManagedClusterModule>> {
        Ok(self.hub_module(name))
    }

    async fn update_status(
        &self,
        module: &ManagedClusterModule,
        status: &ManagedClusterModuleStatus,
    ) -> Result<()> {
        let mut stored =
            self.hub_modules
                .get_mut(module.name())
                .ok_or_else(|| Error::ResourceNotFound {
                    kind: "ManagedClusterModule".into(),
                    name: module.name().to_string(),
                })?;
        stored.status = Some(status.clone());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
