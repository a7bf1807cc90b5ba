//! Kernel mapping resolution
//!
//! Turns a node's reported kernel version into a concrete image recipe:
//!
//! ```text
//! raw kernel ──▶ KernelVersion (strip '+') ──▶ find_mapping (first match)
//!                                                   │
//!                                                   ▼
//!                              TemplateVars ──▶ ResolvedMapping ──▶ MappingCache
//! ```

pub mod cache;
pub mod matcher;
pub mod template;
pub mod version;

pub use cache::{MappingCache, ResolutionFailure};
pub use matcher::{find_mapping, KernelSelector};
pub use template::{
    resolve, OsConfig, ResolvedBuild, ResolvedMapping, ResolvedSign, TemplateVars,
};
pub use version::KernelVersion;

use crate::crd::ModuleSpec;
use crate::domain::ModuleRef;
use crate::error::{Error, Result};

/// Find the first matching rule of `spec` for `kernel` and resolve it
pub fn resolve_kernel(
    module: &ModuleRef,
    spec: &ModuleSpec,
    kernel: &KernelVersion,
    os: &OsConfig,
) -> Result<ResolvedMapping> {
    let rule = find_mapping(kernel, &spec.kernel_mappings)?.ok_or_else(|| {
        Error::NoKernelMapping {
            kernel_version: kernel.to_string(),
        }
    })?;
    resolve(module, spec, rule, kernel, os)
}
