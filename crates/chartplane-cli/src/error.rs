//! CLI error types with exit code handling
//!
//! Library errors are classified into a small set of diagnostics, each with a
//! stable exit code.

use chartplane_core::CoreError;
use chartplane_kube::KubeError;
use chartplane_repo::RepoError;
use miette::Diagnostic;
use thiserror::Error;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CliError {
    /// The user supplied something unusable
    #[error("Invalid input: {message}")]
    #[diagnostic(code(chartplane::cli::input))]
    Input {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error("{message}")]
    #[diagnostic(code(chartplane::cli::not_found))]
    NotFound {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Dependency or values reference resolution failed
    #[error("Resolution failed: {message}")]
    #[diagnostic(code(chartplane::cli::resolution))]
    Resolution {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(chartplane::cli::config),
        help("check $CHARTPLANE_CONFIG or the files under ~/.config/chartplane")
    )]
    Config { message: String },

    #[error("Cluster error: {message}")]
    #[diagnostic(code(chartplane::cli::cluster))]
    Cluster { message: String },

    /// IO error (file not found, permissions, etc.)
    #[error("IO error: {message}")]
    #[diagnostic(code(chartplane::cli::io))]
    Io { message: String },

    #[error("{message}")]
    #[diagnostic(code(chartplane::cli::error))]
    Other { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Input { .. } => exit_codes::INPUT_ERROR,
            CliError::NotFound { .. } => exit_codes::NOT_FOUND,
            CliError::Resolution { .. } => exit_codes::RESOLUTION_ERROR,
            CliError::Config { .. } => exit_codes::CONFIG_ERROR,
            CliError::Cluster { .. } => exit_codes::CLUSTER_ERROR,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Other { .. } => exit_codes::ERROR,
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
            help: None,
        }
    }

    pub fn not_found(message: impl Into<String>, help: Option<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            help,
        }
    }

    fn resolution(message: impl Into<String>, help: Option<String>) -> Self {
        Self::Resolution {
            message: message.into(),
            help,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match err {
            CoreError::InvalidConstraint { .. }
            | CoreError::InvalidVersion { .. }
            | CoreError::InvalidPackage { .. }
            | CoreError::MissingArchiveEntry { .. }
            | CoreError::YamlParse(_)
            | CoreError::JsonParse(_)
            | CoreError::ValuesMerge { .. } => CliError::input(message),
            CoreError::ConditionParseFailed { .. } => CliError::resolution(message, None),
            CoreError::InvalidConfig { .. } => CliError::Config { message },
            CoreError::Io(_) => CliError::Io { message },
        }
    }
}

impl From<KubeError> for CliError {
    fn from(err: KubeError) -> Self {
        let message = err.to_string();
        match err {
            KubeError::Core(core) => core.into(),
            KubeError::ObjectNotFound { .. } | KubeError::ContentNotFound { .. } => {
                CliError::not_found(message, None)
            }
            KubeError::ValuesRefNotFound { .. } => CliError::resolution(
                message,
                Some("every child reference must exist before composing".to_string()),
            ),
            KubeError::CyclicOrTooDeepReference { .. } => CliError::resolution(
                message,
                Some("set values.overflow to 'report' to drop the branch instead".to_string()),
            ),
            KubeError::ConvergenceTimeout { .. } | KubeError::WatchClosed { .. } => {
                CliError::resolution(message, None)
            }
            _ => CliError::Cluster { message },
        }
    }
}

impl From<RepoError> for CliError {
    fn from(err: RepoError) -> Self {
        let message = err.to_string();
        match err {
            RepoError::Kube(kube) => kube.into(),
            RepoError::Core(core) => core.into(),
            RepoError::RegistryNotFound { name } => CliError::not_found(
                message,
                Some(format!("add '{name}' to registries.yaml")),
            ),
            RepoError::PackageNotFound { .. } | RepoError::VersionNotFound { .. } => {
                CliError::not_found(message, None)
            }
            RepoError::DependencyResolutionFailed { .. } | RepoError::DependencyCycle { .. } => {
                CliError::resolution(message, None)
            }
            RepoError::RegistryAlreadyExists { .. }
            | RepoError::InvalidRegistryUrl { .. }
            | RepoError::InvalidConfig { .. } => CliError::Config { message },
            RepoError::Io(_) => CliError::Io { message },
            _ => CliError::Other { message },
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
