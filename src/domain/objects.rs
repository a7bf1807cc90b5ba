//! Domain Objects - Derived objects managed by the reconciler
//!
//! Each object kind the reconciler creates is an explicit struct carrying the
//! metadata the core relies on (name, namespace, correlation labels, desired
//! hash) plus the few fields it reads back. Adapters translate them to and
//! from concrete API objects.

use crate::error::Result;
use crate::labels::{LAST_HASH_ANNOTATION, TARGET_KERNEL_LABEL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// =============================================================================
// Identity
// =============================================================================

/// Key of a top-level object handed to the reconciler
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Identity of the module a derived object belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleRef {
    pub name: String,
    /// Namespace where the module's jobs and workloads live
    pub namespace: String,
}

impl ModuleRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// Owner reference set on derived objects so they follow their owner's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// Metadata shared by every derived object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedMeta {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: Option<OwnerRef>,
    pub created_at: Option<DateTime<Utc>>,
}

impl DerivedMeta {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner: &OwnerRef) -> Self {
        self.owner = Some(owner.clone());
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.annotations
            .insert(LAST_HASH_ANNOTATION.to_string(), hash.into());
        self
    }
}

/// Accessors the core needs on any derived object
pub trait DerivedObject: Clone + Send + Sync + 'static {
    /// API kind, used in logs and errors
    const KIND: &'static str;

    fn meta(&self) -> &DerivedMeta;

    fn meta_mut(&mut self) -> &mut DerivedMeta;

    /// Copy fields owned by the API server (status, timestamps) from the
    /// stored version, so applying a desired object never clobbers them
    fn merge_observed(&mut self, _existing: &Self) {}

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> &str {
        &self.meta().namespace
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.meta().labels
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.meta().labels.get(key).map(String::as_str)
    }

    fn kernel_version(&self) -> Option<&str> {
        self.label(TARGET_KERNEL_LABEL)
    }

    fn desired_hash(&self) -> Option<&str> {
        self.meta()
            .annotations
            .get(LAST_HASH_ANNOTATION)
            .map(String::as_str)
    }
}

/// SHA-256 over the JSON form of a desired template
pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Short stable hash used to build DNS-safe names from free-form values
pub fn short_hash(value: &str) -> String {
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    digest[..10].to_string()
}

/// Result of a create-or-patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Patched,
    Unchanged,
}

impl std::fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyOutcome::Created => write!(f, "created"),
            ApplyOutcome::Patched => write!(f, "patched"),
            ApplyOutcome::Unchanged => write!(f, "unchanged"),
        }
    }
}

// =============================================================================
// Execution Jobs
// =============================================================================

/// Pipeline stage an execution job belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Build,
    Sign,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Build => "build",
            StageKind::Sign => "sign",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "build" => Some(StageKind::Build),
            "sign" => Some(StageKind::Sign),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status vocabulary exposed by execution jobs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JobPhase {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
    /// Anything the adapter could not classify
    Unknown(String),
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

/// Volume mounted into a job container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobVolume {
    pub name: String,
    pub source: VolumeSource,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    Secret(String),
    ConfigMap(String),
}

/// Pod template of an execution job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub image: String,
    pub args: Vec<String>,
    pub volumes: Vec<JobVolume>,
    pub backoff_limit: i32,
}

/// A build or sign job
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionJob {
    pub meta: DerivedMeta,
    pub stage: StageKind,
    pub template: JobTemplate,
    pub phase: JobPhase,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DerivedObject for ExecutionJob {
    const KIND: &'static str = "Job";

    fn meta(&self) -> &DerivedMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DerivedMeta {
        &mut self.meta
    }

    fn merge_observed(&mut self, existing: &Self) {
        self.phase = existing.phase.clone();
        self.completed_at = existing.completed_at;
        self.meta.created_at = existing.meta.created_at;
    }
}

impl ExecutionJob {
    /// When the job reached a terminal phase, falling back to creation time
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        if !self.phase.is_terminal() {
            return None;
        }
        self.completed_at.or(self.meta.created_at)
    }
}

// =============================================================================
// Workloads
// =============================================================================

/// Desired pod template of a daemon-managed workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    /// Command run before the container stops
    pub pre_stop: Vec<String>,
    pub node_selector: BTreeMap<String, String>,
    pub service_account: Option<String>,
    pub image_pull_secret: Option<String>,
    pub privileged: bool,
}

/// Node counts reported by a workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub desired: u32,
    pub ready: u32,
    pub available: u32,
}

/// A per-kernel module loader or a per-module device plugin
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub meta: DerivedMeta,
    pub spec: WorkloadSpec,
    pub status: WorkloadStatus,
}

impl DerivedObject for Workload {
    const KIND: &'static str = "DaemonSet";

    fn meta(&self) -> &DerivedMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DerivedMeta {
        &mut self.meta
    }

    fn merge_observed(&mut self, existing: &Self) {
        self.status = existing.status;
        self.meta.created_at = existing.meta.created_at;
    }
}

// =============================================================================
// Remote Manifests
// =============================================================================

/// Work shipped from the hub to one managed cluster
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteManifest {
    pub meta: DerivedMeta,
    /// Objects applied on the spoke
    pub manifests: Vec<serde_json::Value>,
    pub applied: bool,
    pub available: bool,
}

impl DerivedObject for RemoteManifest {
    const KIND: &'static str = "ManifestWork";

    fn meta(&self) -> &DerivedMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DerivedMeta {
        &mut self.meta
    }

    fn merge_observed(&mut self, existing: &Self) {
        self.applied = existing.applied;
        self.available = existing.available;
        self.meta.created_at = existing.meta.created_at;
    }
}

// =============================================================================
// Read-only Inputs
// =============================================================================

/// A cluster node as seen by the reconciler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Kernel version reported by the kubelet, as-is
    pub kernel_version: String,
}

/// A managed cluster as seen by the hub
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Kernel versions from the cluster claim, `None` when the claim is missing
    pub kernel_versions: Option<Vec<String>>,
}

impl ClusterInfo {
    /// Build from the raw kernel-versions claim (one version per line)
    pub fn from_claim(
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
        claim: Option<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            labels,
            kernel_versions: claim.map(|value| {
                value
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let template = JobTemplate {
            image: "builder:latest".into(),
            args: vec!["--destination=example.com/kmod:5.14".into()],
            volumes: vec![],
            backoff_limit: 3,
        };
        let a = content_hash(&template).unwrap();
        let b = content_hash(&template.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let mut changed = template;
        changed.backoff_limit = 4;
        assert_ne!(a, content_hash(&changed).unwrap());
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("5.14.0-1").len(), 10);
        assert_eq!(short_hash("5.14.0-1"), short_hash("5.14.0-1"));
        assert_ne!(short_hash("5.14.0-1"), short_hash("5.14.0-2"));
    }

    #[test]
    fn test_stage_kind_round_trip() {
        assert_eq!(StageKind::parse("build"), Some(StageKind::Build));
        assert_eq!(StageKind::parse("sign"), Some(StageKind::Sign));
        assert_eq!(StageKind::parse("push"), None);
        assert_eq!(format!("{}", StageKind::Sign), "sign");
    }

    #[test]
    fn test_finished_at_only_for_terminal_jobs() {
        let created = Utc::now();
        let mut job = ExecutionJob {
            meta: DerivedMeta {
                created_at: Some(created),
                ..Default::default()
            },
            stage: StageKind::Build,
            template: JobTemplate::default(),
            phase: JobPhase::Running,
            completed_at: None,
        };
        assert_eq!(job.finished_at(), None);

        job.phase = JobPhase::Failed;
        assert_eq!(job.finished_at(), Some(created));
    }

    #[test]
    fn test_cluster_claim_parsing() {
        let cluster = ClusterInfo::from_claim("spoke-1", BTreeMap::new(), Some("5.14.0-1\n\n 5.15.0-2 \n"));
        assert_eq!(
            cluster.kernel_versions,
            Some(vec!["5.14.0-1".to_string(), "5.15.0-2".to_string()])
        );
        assert_eq!(ClusterInfo::from_claim("spoke-2", BTreeMap::new(), None).kernel_versions, None);
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::namespaced("ns", "kmod").to_string(), "ns/kmod");
        assert_eq!(ObjectKey::cluster_scoped("kmod").to_string(), "kmod");
    }
}
