//! Module CRD
//!
//! Declares an out-of-tree kernel module: which nodes it targets, how the
//! container image carrying the module is chosen per kernel version, and how
//! that image is built and signed when it does not exist yet.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Module CRD
// =============================================================================

/// Module describes a kernel module to load on every node whose running kernel
/// matches one of its kernel mappings.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "Module",
    plural = "modules",
    shortname = "mod",
    status = "ModuleStatus",
    printcolumn = r#"{"name": "Module", "type": "string", "jsonPath": ".spec.moduleName"}"#,
    printcolumn = r#"{"name": "Desired", "type": "integer", "jsonPath": ".status.moduleLoader.desiredNumber"}"#,
    printcolumn = r#"{"name": "Ready", "type": "integer", "jsonPath": ".status.moduleLoader.readyNumber"}"#,
    printcolumn = r#"{"name": "Available", "type": "integer", "jsonPath": ".status.moduleLoader.availableNumber"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// Node label selector (equality on every entry)
    #[serde(default)]
    pub selector: BTreeMap<String, String>,

    /// Name of the kernel module to load (as passed to modprobe)
    pub module_name: String,

    /// Parameters passed to modprobe
    #[serde(default)]
    pub module_parameters: Vec<String>,

    /// Default image for mappings that do not set one
    #[serde(default)]
    pub container_image: Option<String>,

    /// Default build recipe for mappings that do not set one
    #[serde(default)]
    pub build: Option<BuildSpec>,

    /// Default signing recipe for mappings that do not set one
    #[serde(default)]
    pub sign: Option<SignSpec>,

    /// Ordered kernel mappings; the first match wins
    #[serde(default)]
    pub kernel_mappings: Vec<KernelMapping>,

    /// Optional device plugin deployed alongside the module
    #[serde(default)]
    pub device_plugin: Option<DevicePluginSpec>,

    /// Pull secret for the module images
    #[serde(default)]
    pub image_repo_secret: Option<String>,

    /// Service account for the module-loader workloads
    #[serde(default)]
    pub service_account_name: Option<String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// A rule associating kernel versions with an image recipe.
///
/// Exactly one of `literal` and `regexp` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KernelMapping {
    /// Exact kernel version
    #[serde(default)]
    pub literal: Option<String>,

    /// Regular expression searched in the kernel version
    #[serde(default)]
    pub regexp: Option<String>,

    /// Image template for this kernel; may contain `${...}` placeholders
    #[serde(default)]
    pub container_image: Option<String>,

    /// Build recipe overriding the module default
    #[serde(default)]
    pub build: Option<BuildSpec>,

    /// Signing recipe overriding the module default
    #[serde(default)]
    pub sign: Option<SignSpec>,
}

/// How to build the module image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// ConfigMap holding the Dockerfile under the `dockerfile` key
    pub dockerfile_config_map: String,

    /// Build arguments; values may contain placeholders
    #[serde(default)]
    pub build_args: Vec<BuildArg>,

    /// Secrets mounted into the build
    #[serde(default)]
    pub secrets: Vec<String>,

    /// Push to and pull from registries over plain HTTP
    #[serde(default)]
    pub insecure_registry: bool,
}

/// A single build argument
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildArg {
    pub name: String,
    pub value: String,
}

/// How to sign the module files inside the image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignSpec {
    /// Secret holding the private key under `key`
    pub key_secret: String,

    /// Secret holding the public certificate under `cert`
    pub cert_secret: String,

    /// Paths of the files to sign inside the image; may contain placeholders
    pub files_to_sign: Vec<String>,

    /// Image to sign when no build precedes signing; may contain placeholders
    #[serde(default)]
    pub unsigned_image: Option<String>,
}

/// Device plugin deployed on every selected node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginSpec {
    /// Device plugin image
    pub image: String,

    /// Arguments for the device plugin container
    #[serde(default)]
    pub args: Vec<String>,

    /// Service account for the device plugin
    #[serde(default)]
    pub service_account_name: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the Module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    /// Node counts for the module-loader workloads
    #[serde(default)]
    pub module_loader: ModuleLoaderStatus,

    /// Per-kernel image state
    #[serde(default)]
    pub images: Vec<ImageStatus>,

    /// Kernel versions reported by selected nodes that no mapping matches
    #[serde(default)]
    pub unmatched_kernel_versions: Vec<String>,

    /// Kernel versions whose mapping could not be resolved
    #[serde(default)]
    pub template_errors: Vec<TemplateErrorStatus>,

    /// Last generation the status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<ModuleCondition>,
}

/// Node counts for the module-loader workloads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderStatus {
    /// Nodes matching the module selector
    #[serde(default)]
    pub nodes_matching_selector_number: u32,

    /// Nodes whose kernel resolved to a mapping
    #[serde(default)]
    pub desired_number: u32,

    /// Nodes whose kernel image is ready and deployed
    #[serde(default)]
    pub ready_number: u32,

    /// Nodes reporting the module-loader pod as available
    #[serde(default)]
    pub available_number: u32,
}

/// Image state for one kernel version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    pub kernel_version: String,

    /// Final image reference
    pub image: String,

    pub state: ImageState,

    /// Last observed error for this image
    #[serde(default)]
    pub message: Option<String>,
}

/// Lifecycle of a module image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ImageState {
    #[default]
    Pending,
    Building,
    Signing,
    Ready,
    Error,
}

impl std::fmt::Display for ImageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageState::Pending => write!(f, "Pending"),
            ImageState::Building => write!(f, "Building"),
            ImageState::Signing => write!(f, "Signing"),
            ImageState::Ready => write!(f, "Ready"),
            ImageState::Error => write!(f, "Error"),
        }
    }
}

/// A kernel version whose mapping failed template substitution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateErrorStatus {
    pub kernel_version: String,
    pub message: String,
}

/// Module condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: String,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Message
    #[serde(default)]
    pub message: Option<String>,
}

impl ModuleCondition {
    pub fn new(r#type: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

/// Replace the condition of the same type, keeping its transition time when
/// the status did not change
pub fn upsert_condition(conditions: &mut Vec<ModuleCondition>, mut condition: ModuleCondition) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

impl Module {
    /// Get the module name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Get the module namespace
    pub fn namespace_or_default(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }
}

impl ModuleStatus {
    /// Set a condition, keeping the transition time when the status is unchanged
    pub fn set_condition(&mut self, condition: ModuleCondition) {
        upsert_condition(&mut self.conditions, condition);
    }

    /// Find a condition by type
    pub fn condition(&self, r#type: &str) -> Option<&ModuleCondition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Find the image status for a kernel version
    pub fn image(&self, kernel_version: &str) -> Option<&ImageStatus> {
        self.images
            .iter()
            .find(|i| i.kernel_version == kernel_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_state_display() {
        assert_eq!(format!("{}", ImageState::Building), "Building");
        assert_eq!(format!("{}", ImageState::Ready), "Ready");
    }

    #[test]
    fn test_spec_deserialization() {
        let spec: ModuleSpec = serde_json::from_value(serde_json::json!({
            "moduleName": "kmm_ci_a",
            "selector": {"node-role.kubernetes.io/worker": ""},
            "kernelMappings": [
                {"literal": "5.14.0-1", "containerImage": "registry.example.com/kmod:${KERNEL_FULL_VERSION}"},
                {"regexp": "^.+\\.el9\\..+$", "build": {"dockerfileConfigMap": "kmod-dockerfile"}}
            ]
        }))
        .unwrap();

        assert_eq!(spec.kernel_mappings.len(), 2);
        assert_eq!(spec.kernel_mappings[0].literal.as_deref(), Some("5.14.0-1"));
        assert!(spec.kernel_mappings[1].build.is_some());
        assert!(spec.device_plugin.is_none());
    }

    #[test]
    fn test_set_condition_keeps_transition_time() {
        let mut status = ModuleStatus::default();
        let first = ModuleCondition::new("Ready", true, "AllReady", "ok");
        let first_time = first.last_transition_time;
        status.set_condition(first);

        status.set_condition(ModuleCondition::new("Ready", true, "AllReady", "still ok"));
        let ready = status.condition("Ready").unwrap();
        assert_eq!(ready.last_transition_time, first_time);
        assert_eq!(ready.message.as_deref(), Some("still ok"));
        assert_eq!(status.conditions.len(), 1);
    }
}
