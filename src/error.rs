//! Error types for the Kernel Module Operator
//!
//! Provides structured error types for kernel mapping resolution, the
//! build/sign pipeline, object stores, and the operator runtime.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Conflicting write on {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    // =========================================================================
    // Kernel Mapping Errors
    // =========================================================================
    #[error("Invalid kernel mapping: {reason}")]
    InvalidKernelMapping { reason: String },

    #[error("Invalid kernel pattern {pattern:?}: {source}")]
    InvalidKernelPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("No kernel mapping matches kernel {kernel_version}")]
    NoKernelMapping { kernel_version: String },

    #[error("Template error in {field}: {reason}")]
    Template { field: String, reason: String },

    // =========================================================================
    // Pipeline Errors
    // =========================================================================
    #[error("Found {count} {stage} jobs for {module} on kernel {kernel_version}; expected at most one")]
    DuplicateJobs {
        module: String,
        kernel_version: String,
        stage: String,
        count: usize,
    },

    #[error("Registry lookup failed: {0}")]
    RegistryRequest(#[from] reqwest::Error),

    #[error("Registry returned HTTP {status} for {image}")]
    RegistryStatus { image: String, status: u16 },

    #[error("Invalid image reference: {0}")]
    InvalidImageReference(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Conflict { .. }
            | Error::StoreUnavailable(_)
            | Error::RegistryRequest(_)
            | Error::RegistryStatus { .. } => ErrorAction::RequeueWithBackoff,

            // Two jobs for one stage usually means a creation race; let it settle
            Error::DuplicateJobs { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Spec errors - wait for the user to change the object
            Error::Configuration(_)
            | Error::InvalidKernelMapping { .. }
            | Error::InvalidKernelPattern { .. }
            | Error::NoKernelMapping { .. }
            | Error::Template { .. }
            | Error::InvalidImageReference(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::Conflict { .. }
                | Error::StoreUnavailable(_)
                | Error::RegistryRequest(_)
                | Error::RegistryStatus { .. }
        )
    }

    /// Check if this error only concerns the resolution of one kernel version
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidKernelMapping { .. }
                | Error::InvalidKernelPattern { .. }
                | Error::NoKernelMapping { .. }
                | Error::Template { .. }
        )
    }

    /// Check if this is a Kubernetes "not found" response
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
