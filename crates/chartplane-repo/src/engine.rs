//! Hand-off to the release execution engine
//!
//! Rendering manifests and applying them to a cluster happen outside this
//! crate. A [`ReleaseEngine`] receives fully resolved packages with their
//! composed values and reports the revision it installed.

use async_trait::async_trait;
use chartplane_core::{PackageVersion, Values};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{RepoError, Result};

/// A release as recorded by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub release: String,
    pub namespace: String,
    pub package: String,
    pub version: String,
    /// Increments on every install or upgrade
    pub number: u32,
    pub status: RevisionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevisionStatus {
    Deployed,
    Failed,
    Uninstalled,
}

impl std::fmt::Display for RevisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::Uninstalled => "uninstalled",
        };
        write!(f, "{}", s)
    }
}

/// Executes releases
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait ReleaseEngine: Send + Sync {
    async fn install(
        &self,
        release: &str,
        namespace: &str,
        package: &PackageVersion,
        values: &Values,
    ) -> Result<Revision>;

    async fn upgrade(
        &self,
        release: &str,
        namespace: &str,
        package: &PackageVersion,
        values: &Values,
    ) -> Result<Revision>;

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<Revision>;

    /// The current revision, or `None` if the release is not installed
    async fn get_installed(&self, release: &str, namespace: &str) -> Result<Option<Revision>>;
}

/// In-memory engine recording every call
#[derive(Clone, Default)]
pub struct MockReleaseEngine {
    releases: Arc<RwLock<BTreeMap<(String, String), Revision>>>,
    calls: Arc<RwLock<Vec<String>>>,
}

impl MockReleaseEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls made so far, as `operation:release`
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, operation: &str, release: &str) {
        self.calls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{operation}:{release}"));
    }

    fn deploy(&self, release: &str, namespace: &str, package: &PackageVersion) -> Revision {
        let mut releases = self.releases.write().unwrap_or_else(PoisonError::into_inner);
        let key = (namespace.to_string(), release.to_string());
        let number = releases.get(&key).map_or(1, |r| r.number + 1);
        let revision = Revision {
            release: release.to_string(),
            namespace: namespace.to_string(),
            package: package.name().to_string(),
            version: package.version().to_string(),
            number,
            status: RevisionStatus::Deployed,
        };
        releases.insert(key, revision.clone());
        revision
    }
}

#[async_trait]
impl ReleaseEngine for MockReleaseEngine {
    async fn install(
        &self,
        release: &str,
        namespace: &str,
        package: &PackageVersion,
        _values: &Values,
    ) -> Result<Revision> {
        self.record("install", release);
        if self.get_installed(release, namespace).await?.is_some() {
            return Err(RepoError::Engine {
                release: release.to_string(),
                message: "already installed".to_string(),
            });
        }
        Ok(self.deploy(release, namespace, package))
    }

    async fn upgrade(
        &self,
        release: &str,
        namespace: &str,
        package: &PackageVersion,
        _values: &Values,
    ) -> Result<Revision> {
        self.record("upgrade", release);
        Ok(self.deploy(release, namespace, package))
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<Revision> {
        self.record("uninstall", release);
        let removed = self
            .releases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(namespace.to_string(), release.to_string()));
        match removed {
            Some(mut revision) => {
                revision.status = RevisionStatus::Uninstalled;
                Ok(revision)
            }
            None => Err(RepoError::Engine {
                release: release.to_string(),
                message: "not installed".to_string(),
            }),
        }
    }

    async fn get_installed(&self, release: &str, namespace: &str) -> Result<Option<Revision>> {
        Ok(self
            .releases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), release.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartplane_core::PackageMetadata;
    use semver::Version;

    fn package(version: &str) -> PackageVersion {
        PackageVersion::new(PackageMetadata::new("web", Version::parse(version).unwrap()), "stable")
    }

    #[tokio::test]
    async fn test_install_upgrade_uninstall() {
        let engine = MockReleaseEngine::new();
        let values = Values::new();

        let first = engine.install("web", "apps", &package("1.0.0"), &values).await.unwrap();
        assert_eq!(first.number, 1);
        assert!(engine.install("web", "apps", &package("1.0.0"), &values).await.is_err());

        let second = engine.upgrade("web", "apps", &package("1.1.0"), &values).await.unwrap();
        assert_eq!(second.number, 2);
        assert_eq!(second.version, "1.1.0");

        let removed = engine.uninstall("web", "apps").await.unwrap();
        assert_eq!(removed.status, RevisionStatus::Uninstalled);
        assert!(engine.get_installed("web", "apps").await.unwrap().is_none());
    }
}
