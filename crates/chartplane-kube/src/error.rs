//! Error types for chartplane-kube

use chartplane_core::CoreError;
use thiserror::Error;

use crate::values::OverflowKind;

/// Result type for chartplane-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors raised by the object store and the components built on it
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("{kind} '{name}' not found in namespace '{namespace}'")]
    ObjectNotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} '{name}' already exists in namespace '{namespace}'")]
    ObjectAlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    /// Optimistic concurrency check failed
    #[error("{kind} '{name}' was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        kind: String,
        name: String,
        expected: String,
        actual: String,
    },

    /// No templates artifact for the package version
    #[error("content for {package}@{version} not found in registry '{registry}'")]
    ContentNotFound {
        registry: String,
        package: String,
        version: String,
    },

    #[error("artifact '{name}' failed integrity check: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("values reference '{name}' (referenced by '{parent}') not found")]
    ValuesRefNotFound { name: String, parent: String },

    #[error("values reference '{reference}' at depth {depth} is {kind}: {path}")]
    CyclicOrTooDeepReference {
        reference: String,
        depth: usize,
        kind: OverflowKind,
        path: String,
    },

    #[error("'{name}' did not converge within {timeout}")]
    ConvergenceTimeout { name: String, timeout: String },

    #[error("watch on '{name}' ended before convergence: {reason}")]
    WatchClosed { name: String, reason: String },

    #[error("invalid stored object '{name}': {message}")]
    InvalidObject { name: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::ObjectNotFound { .. })
    }
}
