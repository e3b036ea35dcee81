//! Registry index types
//!
//! Helm-compatible `index.yaml` format

use chartplane_core::{
    Dependency, PackageMetadata, VersionConstraint, VersionResolver, is_unresolved, parse_version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{RepoError, Result};

/// Registry index (Helm-compatible)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryIndex {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Package versions by package name, in index order
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<PackEntry>>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

impl Default for RepositoryIndex {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            entries: BTreeMap::new(),
        }
    }
}

impl RepositoryIndex {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RepoError::InvalidIndex {
            message: e.to_string(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let yaml = std::str::from_utf8(bytes).map_err(|e| RepoError::InvalidIndex {
            message: format!("Invalid UTF-8: {e}"),
        })?;
        Self::from_yaml(yaml)
    }

    pub fn get(&self, name: &str) -> Option<&[PackEntry]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// Resolve a constraint against a package's versions.
    ///
    /// `Ok(None)` when no version satisfies the constraint.
    pub fn resolve(&self, name: &str, constraint: &str) -> Result<Option<&PackEntry>> {
        let entries = self.get(name).unwrap_or_default();
        resolve_entries(entries, constraint)
    }

    pub fn add_entry(&mut self, entry: PackEntry) {
        self.entries.entry(entry.name.clone()).or_default().push(entry);
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// Resolve a constraint against index entries
pub fn resolve_entries<'a>(entries: &'a [PackEntry], constraint: &str) -> Result<Option<&'a PackEntry>> {
    let constraint = VersionConstraint::parse(constraint)?;
    let resolved = VersionResolver::resolve_with(&constraint, entries.iter().map(|e| &e.version))?;
    if is_unresolved(&resolved) {
        return Ok(None);
    }

    // The resolver keeps the first of equal versions, so take the first entry too
    for entry in entries {
        if parse_version(&entry.version)? == resolved {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// One package version in an index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackEntry {
    pub name: String,

    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Archive download URLs, possibly relative to the registry
    #[serde(default)]
    pub urls: Vec<String>,

    /// SHA256 digest of the archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<IndexDependency>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

impl PackEntry {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            app_version: None,
            description: None,
            urls: Vec::new(),
            digest: None,
            dependencies: Vec::new(),
            api_version: None,
        }
    }

    /// Primary download URL
    pub fn download_url(&self) -> Option<&str> {
        self.urls.first().map(String::as_str)
    }

    /// Package metadata described by this entry
    pub fn to_metadata(&self) -> Result<PackageMetadata> {
        let mut metadata = PackageMetadata::new(&self.name, parse_version(&self.version)?);
        metadata.api_version = self.api_version.clone().or(metadata.api_version);
        metadata.description = self.description.clone();
        metadata.app_version = self.app_version.clone();
        metadata.dependencies = self.dependencies.iter().map(IndexDependency::to_dependency).collect();
        Ok(metadata)
    }
}

/// Dependency in an index entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDependency {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl IndexDependency {
    pub fn to_dependency(&self) -> Dependency {
        let mut dependency = Dependency::new(
            &self.name,
            &self.version,
            self.repository.clone().unwrap_or_default(),
        );
        dependency.condition = self.condition.clone();
        dependency.alias = self.alias.clone();
        dependency.tags = self.tags.clone();
        dependency
    }
}
