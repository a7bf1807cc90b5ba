//! Per-pass memoization of kernel mapping resolution
//!
//! Many nodes share a kernel version; resolution runs once per distinct
//! normalized version and every later lookup is served from the cache,
//! including cached failures.

use super::template::ResolvedMapping;
use super::version::KernelVersion;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Why a kernel version could not be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionFailure {
    /// No rule applies to the kernel
    NoMatchingMapping,
    /// A rule is malformed (selector or regular expression)
    InvalidMapping(String),
    /// Placeholder substitution failed
    Template(String),
}

impl ResolutionFailure {
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::NoKernelMapping { .. } => ResolutionFailure::NoMatchingMapping,
            Error::Template { .. } => ResolutionFailure::Template(err.to_string()),
            _ => ResolutionFailure::InvalidMapping(err.to_string()),
        }
    }

    /// Short machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            ResolutionFailure::NoMatchingMapping => "NoMatchingMapping",
            ResolutionFailure::InvalidMapping(_) => "InvalidMapping",
            ResolutionFailure::Template(_) => "TemplateError",
        }
    }
}

impl std::fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionFailure::NoMatchingMapping => write!(f, "no kernel mapping matches"),
            ResolutionFailure::InvalidMapping(msg) | ResolutionFailure::Template(msg) => {
                f.write_str(msg)
            }
        }
    }
}

type Entry = std::result::Result<Arc<ResolvedMapping>, ResolutionFailure>;

/// Resolution cache scoped to a single reconciliation pass
#[derive(Debug, Default)]
pub struct MappingCache {
    entries: HashMap<KernelVersion, Entry>,
    resolutions: usize,
    hits: usize,
}

impl MappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached result for `kernel`, running `resolve` on first use
    pub fn get_or_resolve<F>(&mut self, kernel: &KernelVersion, resolve: F) -> Entry
    where
        F: FnOnce(&KernelVersion) -> Result<ResolvedMapping>,
    {
        if let Some(entry) = self.entries.get(kernel) {
            self.hits += 1;
            return entry.clone();
        }

        self.resolutions += 1;
        let entry = resolve(kernel)
            .map(Arc::new)
            .map_err(|e| ResolutionFailure::from_error(&e));
        self.entries.insert(kernel.clone(), entry.clone());
        entry
    }

    /// Number of times the resolve closure ran
    pub fn resolutions(&self) -> usize {
        self.resolutions
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
