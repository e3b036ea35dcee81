//! Package source: the content store first, the registry second
//!
//! Packages and version indices are read from the content store. When a
//! package or index is missing and a fetcher is configured, it is downloaded
//! from its registry, parsed, and written back so the next read is local.

use chartplane_core::{ArchiveLoader, PackageVersion, TarballLoader};
use chartplane_kube::{ChartContentStore, KubeError, OwnerRef, WriteSummary};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Registry;
use crate::error::{RepoError, Result};
use crate::http::{self, ArchiveFetcher};
use crate::index::{PackEntry, RepositoryIndex};

/// Version indices looked up during one resolution run.
///
/// Create one per run and pass it down; nothing is shared between runs.
#[derive(Debug, Default)]
pub struct IndexCache {
    entries: HashMap<(String, String), Vec<PackEntry>>,
    remote: HashMap<String, RepositoryIndex>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, registry: &str, package: &str) -> Option<&[PackEntry]> {
        self.entries
            .get(&(registry.to_string(), package.to_string()))
            .map(Vec::as_slice)
    }

    pub fn insert(&mut self, registry: &str, package: &str, entries: Vec<PackEntry>) {
        self.entries
            .insert((registry.to_string(), package.to_string()), entries);
    }

    /// Number of cached package indices
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Loads packages and their version indices
#[derive(Clone)]
pub struct PackageSource {
    content: ChartContentStore,
    fetcher: Option<Arc<dyn ArchiveFetcher>>,
    loader: Arc<dyn ArchiveLoader>,
}

impl PackageSource {
    /// A source that only reads the content store
    pub fn new(content: ChartContentStore) -> Self {
        Self {
            content,
            fetcher: None,
            loader: Arc::new(TarballLoader),
        }
    }

    /// Fall back to downloading from registries
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArchiveFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn ArchiveLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn content(&self) -> &ChartContentStore {
        &self.content
    }

    /// Version index of a package in a registry
    pub async fn entries(
        &self,
        registry: &Registry,
        package: &str,
        cache: &mut IndexCache,
    ) -> Result<Vec<PackEntry>> {
        if let Some(entries) = cache.get(&registry.name, package) {
            return Ok(entries.to_vec());
        }

        let entries = match self.content.read_index::<PackEntry>(&registry.name, package).await? {
            Some(entries) => entries,
            None => self.fetch_entries(registry, package, cache).await?,
        };

        cache.insert(&registry.name, package, entries.clone());
        Ok(entries)
    }

    async fn fetch_entries(
        &self,
        registry: &Registry,
        package: &str,
        cache: &mut IndexCache,
    ) -> Result<Vec<PackEntry>> {
        let not_found = || RepoError::PackageNotFound {
            name: package.to_string(),
            registry: registry.name.clone(),
        };
        let Some(fetcher) = &self.fetcher else {
            return Err(not_found());
        };

        if !cache.remote.contains_key(&registry.name) {
            let index = http::fetch_index(fetcher.as_ref(), registry).await?;
            cache.remote.insert(registry.name.clone(), index);
        }
        let entries = cache
            .remote
            .get(&registry.name)
            .and_then(|index| index.get(package))
            .ok_or_else(not_found)?
            .to_vec();

        self.content
            .write_index(&registry.name, package, &entries, None)
            .await?;
        tracing::debug!(registry = %registry.name, package = %package, versions = entries.len(), "cached registry index");
        Ok(entries)
    }

    /// Load the package an index entry describes
    pub async fn load(&self, registry: &Registry, entry: &PackEntry) -> Result<PackageVersion> {
        let metadata = entry.to_metadata()?;
        let mut package = match self.content.load(&registry.name, metadata).await {
            Ok(package) => package,
            Err(e @ KubeError::ContentNotFound { .. }) => match &self.fetcher {
                Some(fetcher) => self.fetch_package(fetcher.as_ref(), registry, entry).await?,
                None => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        };

        if let Some(reference) = entry.download_url() {
            package.download_url = Some(http::resolve_reference_url(&registry.url, reference)?);
        }
        Ok(package)
    }

    async fn fetch_package(
        &self,
        fetcher: &dyn ArchiveFetcher,
        registry: &Registry,
        entry: &PackEntry,
    ) -> Result<PackageVersion> {
        tracing::info!(registry = %registry.name, package = %entry.name, version = %entry.version, "content not stored, fetching archive");

        let bytes = http::fetch_archive(fetcher, registry, entry).await?;
        let mut package = self.loader.load(&bytes)?;

        let expected = entry.to_metadata()?;
        if package.name() != expected.name || *package.version() != expected.version {
            return Err(RepoError::InvalidIndex {
                message: format!(
                    "archive for {}@{} contains {}",
                    entry.name,
                    entry.version,
                    package.key()
                ),
            });
        }

        package.registry = registry.name.clone();
        self.content.write(&package, None).await?;
        Ok(package)
    }

    /// Store a package and add it to its registry's version index
    pub async fn push(
        &self,
        registry: &Registry,
        mut package: PackageVersion,
        owner: Option<&OwnerRef>,
    ) -> Result<WriteSummary> {
        package.registry = registry.name.clone();
        let summary = self.content.write(&package, owner).await?;

        let mut entries = self
            .content
            .read_index::<PackEntry>(&registry.name, package.name())
            .await?
            .unwrap_or_default();
        let version = package.version().to_string();
        entries.retain(|e| e.version != version);

        let mut entry = PackEntry::new(package.name(), version);
        entry.description = package.metadata.description.clone();
        entry.app_version = package.metadata.app_version.clone();
        entry.urls = package.download_url.iter().cloned().collect();
        entry.dependencies = package
            .dependencies()
            .iter()
            .map(|d| crate::index::IndexDependency {
                name: d.name.clone(),
                version: d.version.clone(),
                repository: (!d.repository.is_empty()).then(|| d.repository.clone()),
                condition: d.condition.clone(),
                tags: d.tags.clone(),
                alias: d.alias.clone(),
            })
            .collect();
        entries.push(entry);

        self.content
            .write_index(&registry.name, package.name(), &entries, owner)
            .await?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use async_trait::async_trait;
    use chartplane_core::archive::pack;
    use chartplane_core::{PackageFile, PackageMetadata, Values};
    use chartplane_kube::MockObjectStore;
    use semver::Version;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves fixed bytes per URL and records requests
    #[derive(Default)]
    struct StaticFetcher {
        responses: HashMap<String, Vec<u8>>,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ArchiveFetcher for StaticFetcher {
        async fn fetch(&self, url: &str, _credentials: Option<&Credentials>) -> Result<Vec<u8>> {
            self.requests.lock().unwrap().push(url.to_string());
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| RepoError::HttpError {
                    status: 404,
                    message: url.to_string(),
                })
        }
    }

    fn registry() -> Registry {
        Registry::new("stable", "https://charts.example.com").unwrap()
    }

    fn package() -> PackageVersion {
        let mut package = PackageVersion::new(
            PackageMetadata::new("web", Version::new(1, 0, 0)),
            "",
        );
        package.templates.push(PackageFile::new("deployment.yaml", "kind: Deployment"));
        package.default_values = Values(json!({"replicas": 1}));
        package
    }

    fn content() -> ChartContentStore {
        ChartContentStore::new(Arc::new(MockObjectStore::new()), "default")
    }

    #[tokio::test]
    async fn test_push_then_load_from_store() {
        let source = PackageSource::new(content());
        source.push(&registry(), package(), None).await.unwrap();

        let mut cache = IndexCache::new();
        let entries = source.entries(&registry(), "web", &mut cache).await.unwrap();
        assert_eq!(entries.len(), 1);

        let loaded = source.load(&registry(), &entries[0]).await.unwrap();
        assert_eq!(loaded.registry, "stable");
        assert_eq!(loaded.templates, package().templates);
        assert_eq!(loaded.default_values.0, json!({"replicas": 1}));
    }

    #[tokio::test]
    async fn test_missing_content_without_fetcher() {
        let source = PackageSource::new(content());
        let err = source
            .load(&registry(), &PackEntry::new("web", "1.0.0"))
            .await
            .unwrap_err();
        assert!(err.is_content_not_found());

        let err = source
            .entries(&registry(), "web", &mut IndexCache::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::PackageNotFound { .. }));
    }

    #[tokio::test]
    async fn test_fetches_once_then_reads_store() {
        let index = "entries:\n  web:\n    - name: web\n      version: 1.0.0\n      urls: [web-1.0.0.tgz]\n";
        let mut fetcher = StaticFetcher::default();
        fetcher.responses.insert(
            "https://charts.example.com/index.yaml".to_string(),
            index.as_bytes().to_vec(),
        );
        fetcher.responses.insert(
            "https://charts.example.com/web-1.0.0.tgz".to_string(),
            pack(&package()).unwrap(),
        );
        let fetcher = Arc::new(fetcher);

        let source = PackageSource::new(content()).with_fetcher(fetcher.clone());

        let mut cache = IndexCache::new();
        let entries = source.entries(&registry(), "web", &mut cache).await.unwrap();
        let first = source.load(&registry(), &entries[0]).await.unwrap();
        assert_eq!(
            first.download_url.as_deref(),
            Some("https://charts.example.com/web-1.0.0.tgz")
        );

        // A fresh run reads both the index and the content from the store
        let mut cache = IndexCache::new();
        let entries = source.entries(&registry(), "web", &mut cache).await.unwrap();
        let second = source.load(&registry(), &entries[0]).await.unwrap();

        assert_eq!(first.templates, second.templates);
        assert_eq!(fetcher.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_archive_must_match_entry() {
        let mut fetcher = StaticFetcher::default();
        fetcher.responses.insert(
            "https://charts.example.com/web-2.0.0.tgz".to_string(),
            pack(&package()).unwrap(),
        );
        let source = PackageSource::new(content()).with_fetcher(Arc::new(fetcher));

        let mut entry = PackEntry::new("web", "2.0.0");
        entry.urls.push("web-2.0.0.tgz".to_string());
        let err = source.load(&registry(), &entry).await.unwrap_err();
        assert!(matches!(err, RepoError::InvalidIndex { .. }));
    }

    #[tokio::test]
    async fn test_push_replaces_index_entry() {
        let source = PackageSource::new(content());
        source.push(&registry(), package(), None).await.unwrap();
        source.push(&registry(), package(), None).await.unwrap();

        let mut next = package();
        next.metadata.version = Version::new(1, 1, 0);
        source.push(&registry(), next, None).await.unwrap();

        let entries = source
            .entries(&registry(), "web", &mut IndexCache::new())
            .await
            .unwrap();
        let versions: Vec<_> = entries.iter().map(|e| e.version.as_str()).collect();
        assert_eq!(versions, vec!["1.0.0", "1.1.0"]);
    }
}
