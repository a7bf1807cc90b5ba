//! Operator configuration
//!
//! Built once at startup from an optional YAML file plus CLI overrides and
//! passed by reference into every component.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default node label carrying the full kernel version (node-feature-discovery)
pub const DEFAULT_KERNEL_LABEL: &str = "feature.node.kubernetes.io/kernel-version.full";

/// Process-wide operator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Node label used to pin kernel workloads to matching nodes
    #[serde(default = "default_kernel_label")]
    pub kernel_label: String,

    /// Image running module builds
    #[serde(default = "default_builder_image")]
    pub builder_image: String,

    /// Image running module signing
    #[serde(default = "default_signer_image")]
    pub signer_image: String,

    /// Namespace where the hub runs build and sign jobs
    #[serde(default = "default_hub_namespace")]
    pub hub_job_namespace: String,

    /// Execution job settings
    #[serde(default)]
    pub job: JobConfig,

    /// Requeue settings
    #[serde(default)]
    pub requeue: RequeueConfig,

    /// Registry lookup settings
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Execution job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// How long terminal build/sign jobs are retained
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Pod retries inside a job before it is marked failed
    #[serde(default = "default_backoff_limit")]
    pub backoff_limit: i32,
}

/// Requeue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueConfig {
    /// Delay before revisiting a module with pipelines still running
    #[serde(default = "default_in_progress_secs")]
    pub in_progress_secs: u64,
}

/// Registry lookup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Use plain HTTP for registry lookups
    #[serde(default)]
    pub insecure: bool,

    /// Timeout for a single manifest lookup
    #[serde(default = "default_registry_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_kernel_label() -> String {
    DEFAULT_KERNEL_LABEL.to_string()
}

fn default_builder_image() -> String {
    "gcr.io/kaniko-project/executor:latest".to_string()
}

fn default_signer_image() -> String {
    "quay.io/kmm/signimage:latest".to_string()
}

fn default_hub_namespace() -> String {
    "kmm-operator-system".to_string()
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_backoff_limit() -> i32 {
    3
}

fn default_in_progress_secs() -> u64 {
    30
}

fn default_registry_timeout_secs() -> u64 {
    10
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            backoff_limit: default_backoff_limit(),
        }
    }
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            in_progress_secs: default_in_progress_secs(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            insecure: false,
            timeout_secs: default_registry_timeout_secs(),
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            kernel_label: default_kernel_label(),
            builder_image: default_builder_image(),
            signer_image: default_signer_image(),
            hub_job_namespace: default_hub_namespace(),
            job: JobConfig::default(),
            requeue: RequeueConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: OperatorConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.kernel_label.trim().is_empty() {
            return Err(Error::Configuration("kernelLabel must not be empty".into()));
        }
        for (field, image) in [
            ("builderImage", &self.builder_image),
            ("signerImage", &self.signer_image),
        ] {
            if image.trim().is_empty() {
                return Err(Error::Configuration(format!("{} must not be empty", field)));
            }
        }
        if self.job.backoff_limit < 0 {
            return Err(Error::Configuration(
                "job.backoffLimit must not be negative".into(),
            ));
        }
        if self.requeue.in_progress_secs == 0 {
            return Err(Error::Configuration(
                "requeue.inProgressSecs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job.retention_secs)
    }

    pub fn in_progress_requeue(&self) -> Duration {
        Duration::from_secs(self.requeue.in_progress_secs)
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
