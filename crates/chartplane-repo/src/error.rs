//! Error types for registry and resolution operations

use chartplane_core::CoreError;
use chartplane_kube::KubeError;
use thiserror::Error;

/// Registry, fetch and resolution errors
#[derive(Debug, Error)]
pub enum RepoError {
    // ============ Configuration Errors ============
    #[error("Registry not found: {name}")]
    RegistryNotFound { name: String },

    #[error("Registry already exists: {name}")]
    RegistryAlreadyExists { name: String },

    #[error("Invalid registry URL: {url} - {reason}")]
    InvalidRegistryUrl { url: String, reason: String },

    #[error("Invalid registry configuration: {message}")]
    InvalidConfig { message: String },

    // ============ Network Errors ============
    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    // ============ Authentication Errors ============
    #[error("Authentication required for {url}")]
    AuthRequired { url: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    // ============ Index & Package Errors ============
    #[error("Invalid index: {message}")]
    InvalidIndex { message: String },

    #[error("Package not found: {name} in registry {registry}")]
    PackageNotFound { name: String, registry: String },

    #[error("No version of {name} in registry {registry} satisfies '{constraint}'")]
    VersionNotFound {
        name: String,
        constraint: String,
        registry: String,
    },

    #[error("No download URL for {name}@{version}")]
    MissingDownloadUrl { name: String, version: String },

    #[error("Integrity check failed for {name}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        name: String,
        expected: String,
        actual: String,
    },

    // ============ Dependency Errors ============
    #[error("Failed to resolve dependency '{dependency}' of {package}: {source}")]
    DependencyResolutionFailed {
        package: String,
        dependency: String,
        #[source]
        source: Box<RepoError>,
    },

    #[error("Dependency cycle detected: {cycle}")]
    DependencyCycle { cycle: String },

    // ============ Release Errors ============
    #[error("Release engine failed for {release}: {message}")]
    Engine { release: String, message: String },

    // ============ Lower Layers ============
    #[error(transparent)]
    Kube(#[from] KubeError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

impl RepoError {
    /// Wrap an error raised while resolving one dependency
    pub fn dependency(package: &str, dependency: &str, source: RepoError) -> Self {
        RepoError::DependencyResolutionFailed {
            package: package.to_string(),
            dependency: dependency.to_string(),
            source: Box::new(source),
        }
    }

    /// The innermost error behind nested dependency failures
    pub fn root_cause(&self) -> &RepoError {
        match self {
            RepoError::DependencyResolutionFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Content for the requested version is not in the store
    pub fn is_content_not_found(&self) -> bool {
        matches!(self, RepoError::Kube(KubeError::ContentNotFound { .. }))
    }
}

impl From<reqwest::Error> for RepoError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        if e.is_timeout() {
            RepoError::Timeout { url }
        } else if e.is_connect() {
            RepoError::NetworkError {
                message: format!("Connection to {url} failed: {e}"),
            }
        } else if let Some(status) = e.status() {
            RepoError::HttpError {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            RepoError::NetworkError {
                message: e.to_string(),
            }
        }
    }
}

impl From<serde_yaml::Error> for RepoError {
    fn from(e: serde_yaml::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for RepoError {
    fn from(e: url::ParseError) -> Self {
        RepoError::InvalidRegistryUrl {
            url: String::new(),
            reason: e.to_string(),
        }
    }
}
