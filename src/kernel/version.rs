//! Kernel version normalization

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static XYZ_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)\.(\d+)\.(\d+)").unwrap_or_else(|e| panic!("invalid static regex: {e}"))
});

/// A kernel version with one trailing `+` stripped.
///
/// Kernels built from a dirty tree report `5.14.0-1+`; every comparison,
/// label and cache key uses the normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelVersion(String);

impl KernelVersion {
    pub fn normalize(raw: &str) -> Self {
        Self(raw.strip_suffix('+').unwrap_or(raw).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Leading `X.Y.Z` numeric triple, if the version starts with one
    pub fn parts(&self) -> Option<(u64, u64, u64)> {
        let caps = XYZ_PATTERN.captures(&self.0)?;
        let x = caps.get(1)?.as_str().parse().ok()?;
        let y = caps.get(2)?.as_str().parse().ok()?;
        let z = caps.get(3)?.as_str().parse().ok()?;
        Some((x, y, z))
    }

    pub fn xyz(&self) -> Option<String> {
        self.parts().map(|(x, y, z)| format!("{}.{}.{}", x, y, z))
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for KernelVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
