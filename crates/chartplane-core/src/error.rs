//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid version constraint '{constraint}': {message}")]
    InvalidConstraint { constraint: String, message: String },

    #[error("Invalid version '{version}': {message}")]
    InvalidVersion { version: String, message: String },

    #[error("Condition '{condition}' of dependency '{dependency}' is not usable: {message}")]
    ConditionParseFailed {
        dependency: String,
        condition: String,
        message: String,
    },

    #[error("Invalid package: {message}")]
    InvalidPackage { message: String },

    #[error("Package archive is missing {path}")]
    MissingArchiveEntry { path: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Values merge error: {message}")]
    ValuesMerge { message: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
