//! Template substitution for kernel mappings
//!
//! Image references, build arguments and signing paths may embed `${NAME}`
//! placeholders. Resolution is pure: the same rule, kernel and OS hints always
//! produce the same [`ResolvedMapping`].

use super::version::KernelVersion;
use crate::crd::{BuildArg, BuildSpec, KernelMapping, ModuleSpec, SignSpec};
use crate::domain::{intermediate_image_name, ModuleRef};
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([^}]*)\}").unwrap_or_else(|e| panic!("invalid static regex: {e}"))
});

pub const OS_RELEASE_ID_LABEL: &str = "feature.node.kubernetes.io/system-os_release.ID";
pub const OS_RELEASE_VERSION_ID_LABEL: &str =
    "feature.node.kubernetes.io/system-os_release.VERSION_ID";
pub const OS_RELEASE_VERSION_MAJOR_LABEL: &str =
    "feature.node.kubernetes.io/system-os_release.VERSION_ID.major";

// =============================================================================
// OS Hints
// =============================================================================

/// OS release hints published on nodes by node-feature-discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OsConfig {
    pub release_id: Option<String>,
    pub version_id: Option<String>,
    pub version_major: Option<String>,
}

impl OsConfig {
    pub fn from_node_labels(labels: &BTreeMap<String, String>) -> Self {
        let version_id = labels.get(OS_RELEASE_VERSION_ID_LABEL).cloned();
        let version_major = labels
            .get(OS_RELEASE_VERSION_MAJOR_LABEL)
            .cloned()
            .or_else(|| {
                version_id
                    .as_deref()
                    .and_then(|v| v.split('.').next())
                    .map(str::to_string)
            });
        Self {
            release_id: labels.get(OS_RELEASE_ID_LABEL).cloned(),
            version_id,
            version_major,
        }
    }
}

// =============================================================================
// Variables
// =============================================================================

/// Values available to `${NAME}` placeholders for one kernel
#[derive(Debug, Clone)]
pub struct TemplateVars {
    values: BTreeMap<&'static str, Option<String>>,
}

impl TemplateVars {
    pub fn new(module: &ModuleRef, kernel: &KernelVersion, os: &OsConfig) -> Self {
        let parts = kernel.parts();
        let values = BTreeMap::from([
            ("KERNEL_FULL_VERSION", Some(kernel.to_string())),
            ("KERNEL_VERSION", Some(kernel.to_string())),
            ("KERNEL_XYZ", kernel.xyz()),
            ("KERNEL_X", parts.map(|(x, _, _)| x.to_string())),
            ("KERNEL_Y", parts.map(|(_, y, _)| y.to_string())),
            ("KERNEL_Z", parts.map(|(_, _, z)| z.to_string())),
            ("MOD_NAME", Some(module.name.clone())),
            ("MOD_NAMESPACE", Some(module.namespace.clone())),
            ("OS_RELEASE_ID", os.release_id.clone()),
            ("OS_RELEASE_VERSION_ID", os.version_id.clone()),
            ("OS_RELEASE_VERSION_MAJOR", os.version_major.clone()),
        ]);
        Self { values }
    }

    /// Replace every placeholder in `input`; `field` names the input in errors
    pub fn substitute(&self, field: &str, input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(input) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&input[last..whole.start()]);
            match self.values.get(name.as_str()) {
                Some(Some(value)) => out.push_str(value),
                Some(None) => {
                    return Err(Error::Template {
                        field: field.to_string(),
                        reason: format!("no value for ${{{}}}", name.as_str()),
                    })
                }
                None => {
                    return Err(Error::Template {
                        field: field.to_string(),
                        reason: format!("unknown placeholder ${{{}}}", name.as_str()),
                    })
                }
            }
            last = whole.end();
        }

        let rest = &input[last..];
        if rest.contains("${") {
            return Err(Error::Template {
                field: field.to_string(),
                reason: "unterminated placeholder".into(),
            });
        }
        out.push_str(rest);
        Ok(out)
    }
}

// =============================================================================
// Resolved Mapping
// =============================================================================

/// Build recipe with placeholders substituted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedBuild {
    pub dockerfile_config_map: String,
    pub build_args: Vec<BuildArg>,
    pub secrets: Vec<String>,
    pub insecure_registry: bool,
}

/// Signing recipe with placeholders substituted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSign {
    pub key_secret: String,
    pub cert_secret: String,
    pub files_to_sign: Vec<String>,
    pub unsigned_image: Option<String>,
}

/// A kernel mapping made concrete for one kernel version
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedMapping {
    pub module: ModuleRef,
    pub kernel_version: KernelVersion,
    /// Final image loaded on the nodes
    pub container_image: String,
    pub image_repo_secret: Option<String>,
    pub build: Option<ResolvedBuild>,
    pub sign: Option<ResolvedSign>,
}

impl ResolvedMapping {
    /// Image produced by the build when signing follows it
    pub fn intermediate_image(&self) -> String {
        intermediate_image_name(
            &self.container_image,
            &self.module.namespace,
            &self.module.name,
        )
    }

    /// Image the build stage pushes, if a build is configured
    pub fn build_target(&self) -> Option<String> {
        self.build.as_ref().map(|_| {
            if self.sign.is_some() {
                self.intermediate_image()
            } else {
                self.container_image.clone()
            }
        })
    }

    /// Image the sign stage reads, if signing is configured
    pub fn sign_input(&self) -> Option<String> {
        let sign = self.sign.as_ref()?;
        if self.build.is_some() {
            Some(self.intermediate_image())
        } else {
            sign.unsigned_image.clone()
        }
    }

    /// True when the image is used as-is
    pub fn is_prebuilt(&self) -> bool {
        self.build.is_none() && self.sign.is_none()
    }
}

/// Resolve `rule` for `kernel`, falling back to the module defaults
pub fn resolve(
    module: &ModuleRef,
    spec: &ModuleSpec,
    rule: &KernelMapping,
    kernel: &KernelVersion,
    os: &OsConfig,
) -> Result<ResolvedMapping> {
    let vars = TemplateVars::new(module, kernel, os);

    let image_template = rule
        .container_image
        .as_deref()
        .or(spec.container_image.as_deref())
        .ok_or_else(|| Error::InvalidKernelMapping {
            reason: "no containerImage on the mapping or the module".into(),
        })?;
    let container_image = vars.substitute("containerImage", image_template)?;

    let build = rule
        .build
        .as_ref()
        .or(spec.build.as_ref())
        .map(|b| resolve_build(&vars, b))
        .transpose()?;
    let sign = rule
        .sign
        .as_ref()
        .or(spec.sign.as_ref())
        .map(|s| resolve_sign(&vars, s))
        .transpose()?;

    if let Some(sign) = &sign {
        if build.is_none() && sign.unsigned_image.is_none() {
            return Err(Error::InvalidKernelMapping {
                reason: "sign.unsignedImage is required when no build is configured".into(),
            });
        }
    }

    Ok(ResolvedMapping {
        module: module.clone(),
        kernel_version: kernel.clone(),
        container_image,
        image_repo_secret: spec.image_repo_secret.clone(),
        build,
        sign,
    })
}

fn resolve_build(vars: &TemplateVars, build: &BuildSpec) -> Result<ResolvedBuild> {
    let build_args = build
        .build_args
        .iter()
        .map(|arg| {
            Ok(BuildArg {
                name: arg.name.clone(),
                value: vars.substitute(&format!("buildArgs.{}", arg.name), &arg.value)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ResolvedBuild {
        dockerfile_config_map: build.dockerfile_config_map.clone(),
        build_args,
        secrets: build.secrets.clone(),
        insecure_registry: build.insecure_registry,
    })
}

fn resolve_sign(vars: &TemplateVars, sign: &SignSpec) -> Result<ResolvedSign> {
    let files_to_sign = sign
        .files_to_sign
        .iter()
        .map(|f| vars.substitute("filesToSign", f))
        .collect::<Result<Vec<_>>>()?;
    let unsigned_image = sign
        .unsigned_image
        .as_deref()
        .map(|i| vars.substitute("unsignedImage", i))
        .transpose()?;

    Ok(ResolvedSign {
        key_secret: sign.key_secret.clone(),
        cert_secret: sign.cert_secret.clone(),
        files_to_sign,
        unsigned_image,
    })
}
