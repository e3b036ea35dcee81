//! Registry catalog
//!
//! Stored in `~/.config/chartplane/registries.yaml`:
//!
//! ```yaml
//! apiVersion: chartplane.io/v1
//! registries:
//!   - name: stable
//!     url: https://charts.example.com/stable
//!     group: platform
//!   - name: internal
//!     url: https://charts.internal.example.com
//!     group: platform
//!     auth:
//!       username: deployer
//!       passwordEnv: INTERNAL_CHARTS_PASSWORD
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{RepoError, Result};

/// Catalog of known registries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCatalog {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default)]
    pub registries: Vec<Registry>,
}

fn default_api_version() -> String {
    "chartplane.io/v1".to_string()
}

impl Default for RegistryCatalog {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            registries: Vec::new(),
        }
    }
}

/// How a dependency's registry was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryMatch {
    /// The dependency lives in its parent's registry
    Own,
    /// Another catalog entry has the dependency's URL
    Catalog,
    /// Nothing matched; the parent's registry is used
    Fallback,
}

impl RegistryCatalog {
    /// Load from the default location, empty when absent
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let catalog: Self = serde_yaml::from_str(&content)?;
        for registry in &catalog.registries {
            registry.validate()?;
        }
        Ok(catalog)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| RepoError::InvalidConfig {
            message: "Could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join("chartplane").join("registries.yaml"))
    }

    pub fn get(&self, name: &str) -> Option<&Registry> {
        self.registries.iter().find(|r| r.name == name)
    }

    /// Get a registry by name, failing when unknown
    pub fn require(&self, name: &str) -> Result<&Registry> {
        self.get(name).ok_or_else(|| RepoError::RegistryNotFound {
            name: name.to_string(),
        })
    }

    pub fn add(&mut self, registry: Registry) -> Result<()> {
        if self.get(&registry.name).is_some() {
            return Err(RepoError::RegistryAlreadyExists {
                name: registry.name.clone(),
            });
        }
        registry.validate()?;
        self.registries.push(registry);
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.registries.iter().map(|r| r.name.as_str()).collect()
    }

    /// First registry with `url`, optionally restricted to a group
    pub fn find_by_url(&self, url: &str, group: Option<&str>) -> Option<&Registry> {
        self.registries
            .iter()
            .filter(|r| group.is_none() || r.group.as_deref() == group)
            .find(|r| r.matches_url(url))
    }

    /// Choose the registry a dependency is fetched from.
    ///
    /// A dependency published at its parent's URL stays in the parent's
    /// registry. Otherwise the catalog is searched, narrowed to the parent's
    /// group when it has one; the first match wins. With no match the
    /// parent's registry is used.
    pub fn resolve_source<'a>(
        &'a self,
        parent: &'a Registry,
        dependency_url: &str,
    ) -> (&'a Registry, RegistryMatch) {
        if dependency_url.is_empty() || parent.matches_url(dependency_url) {
            return (parent, RegistryMatch::Own);
        }

        match self.find_by_url(dependency_url, parent.group.as_deref()) {
            Some(found) => (found, RegistryMatch::Catalog),
            None => {
                tracing::warn!(
                    registry = %parent.name,
                    url = %dependency_url,
                    "no registry matches dependency URL, using parent registry"
                );
                (parent, RegistryMatch::Fallback)
            }
        }
    }
}

/// A named source of package indices and archives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub name: String,

    pub url: String,

    /// Registries in the same group resolve each other's dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RegistryAuth>,
}

impl Registry {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let registry = Self {
            name: name.into(),
            url: url.into(),
            group: None,
            auth: None,
        };
        registry.validate()?;
        Ok(registry)
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    fn validate(&self) -> Result<()> {
        let parsed = Url::parse(&self.url).map_err(|e| RepoError::InvalidRegistryUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RepoError::InvalidRegistryUrl {
                url: self.url.clone(),
                reason: "URL must start with http:// or https://".to_string(),
            });
        }
        Ok(())
    }

    /// URL of the registry index
    pub fn index_url(&self) -> String {
        format!("{}/index.yaml", self.url.trim_end_matches('/'))
    }

    /// Compare URLs ignoring a trailing slash
    pub fn matches_url(&self, url: &str) -> bool {
        self.url.trim_end_matches('/') == url.trim_end_matches('/')
    }

    /// Credentials for this registry, if configured
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        self.auth.as_ref().map(RegistryAuth::resolve).transpose()
    }
}

/// Basic auth with the password read from the environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAuth {
    pub username: String,
    pub password_env: String,
}

impl RegistryAuth {
    pub fn resolve(&self) -> Result<Credentials> {
        let password = std::env::var(&self.password_env).map_err(|_| RepoError::AuthFailed {
            message: format!("Environment variable {} not set", self.password_env),
        })?;
        Ok(Credentials {
            username: self.username.clone(),
            password,
        })
    }
}

/// Resolved basic auth credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> RegistryCatalog {
        let mut catalog = RegistryCatalog::default();
        catalog
            .add(Registry::new("stable", "https://charts.example.com/stable").unwrap().with_group("platform"))
            .unwrap();
        catalog
            .add(Registry::new("bitnami-team", "https://charts.bitnami.com/bitnami").unwrap().with_group("team"))
            .unwrap();
        catalog
            .add(Registry::new("bitnami", "https://charts.bitnami.com/bitnami/").unwrap().with_group("platform"))
            .unwrap();
        catalog
    }

    #[test]
    fn test_registry_url_validation() {
        assert!(Registry::new("ok", "https://charts.example.com").is_ok());
        assert!(Registry::new("oci", "oci://ghcr.io/org/charts").is_err());
        assert!(Registry::new("bad", "not a url").is_err());
    }

    #[test]
    fn test_index_url() {
        let registry = Registry::new("stable", "https://charts.example.com/stable/").unwrap();
        assert_eq!(registry.index_url(), "https://charts.example.com/stable/index.yaml");
    }

    #[test]
    fn test_duplicate_registry_rejected() {
        let mut catalog = catalog();
        let err = catalog
            .add(Registry::new("stable", "https://other.example.com").unwrap())
            .unwrap_err();
        assert!(matches!(err, RepoError::RegistryAlreadyExists { .. }));
    }

    #[test]
    fn test_resolve_source_own_registry() {
        let catalog = catalog();
        let parent = catalog.get("stable").unwrap();
        let (registry, matched) = catalog.resolve_source(parent, "https://charts.example.com/stable/");
        assert_eq!(registry.name, "stable");
        assert_eq!(matched, RegistryMatch::Own);
    }

    #[test]
    fn test_resolve_source_narrowed_by_group() {
        let catalog = catalog();
        let parent = catalog.get("stable").unwrap();
        let (registry, matched) = catalog.resolve_source(parent, "https://charts.bitnami.com/bitnami");
        assert_eq!(registry.name, "bitnami");
        assert_eq!(matched, RegistryMatch::Catalog);
    }

    #[test]
    fn test_resolve_source_without_group_takes_first_match() {
        let catalog = catalog();
        let parent = Registry::new("adhoc", "https://adhoc.example.com").unwrap();
        let (registry, _) = catalog.resolve_source(&parent, "https://charts.bitnami.com/bitnami");
        assert_eq!(registry.name, "bitnami-team");
    }

    #[test]
    fn test_resolve_source_falls_back_to_parent() {
        let catalog = catalog();
        let parent = catalog.get("stable").unwrap();
        let (registry, matched) = catalog.resolve_source(parent, "https://unknown.example.com");
        assert_eq!(registry.name, "stable");
        assert_eq!(matched, RegistryMatch::Fallback);
    }

    #[test]
    fn test_catalog_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registries.yaml");

        let mut catalog = catalog();
        catalog.registries[0].auth = Some(RegistryAuth {
            username: "deployer".to_string(),
            password_env: "CHARTPLANE_TEST_PASSWORD".to_string(),
        });
        catalog.save_to(&path).unwrap();

        let loaded = RegistryCatalog::load_from(&path).unwrap();
        assert_eq!(loaded, catalog);
        assert_eq!(loaded.names(), vec!["stable", "bitnami-team", "bitnami"]);
    }

    #[test]
    fn test_credentials_from_env() {
        let auth = RegistryAuth {
            username: "deployer".to_string(),
            password_env: "CHARTPLANE_TEST_REGISTRY_PASSWORD_UNSET".to_string(),
        };
        assert!(matches!(auth.resolve(), Err(RepoError::AuthFailed { .. })));

        let registry = Registry::new("public", "https://charts.example.com").unwrap();
        assert_eq!(registry.credentials().unwrap(), None);
    }
}
