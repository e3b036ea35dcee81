//! Chart content artifacts
//!
//! A package's files are split into one artifact per bucket and sub-bucket:
//!
//! - files directly under a bucket root land in the root artifact
//! - files one directory deeper land in a sub-bucket artifact named after that directory
//! - anything nested deeper is not stored
//!
//! Artifacts are identified by labels (registry, package, version, bucket,
//! sub-bucket). Object names are generated for humans and never used on the
//! read path. Every artifact carries a digest of its data that is checked
//! when it is read back. Re-writing a version removes the artifacts of
//! sub-buckets the package no longer has.

use chartplane_core::{PackageFile, PackageMetadata, PackageVersion, Values};
use semver::Version;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{KubeError, Result};
use crate::store::{
    LabelSelector, ObjectKey, ObjectKind, ObjectStore, OwnerRef, StoredObject,
    sanitize_label_value, sanitize_name,
};

pub const REGISTRY_LABEL: &str = "chartplane.io/registry";
pub const PACKAGE_LABEL: &str = "chartplane.io/package";
pub const VERSION_LABEL: &str = "chartplane.io/version";
pub const BUCKET_LABEL: &str = "chartplane.io/bucket";
pub const SUB_BUCKET_LABEL: &str = "chartplane.io/sub-bucket";

pub const DIGEST_ANNOTATION: &str = "chartplane.io/digest";
/// Unsanitized sub-bucket directory, used to rebuild file paths
pub const SUB_BUCKET_PATH_ANNOTATION: &str = "chartplane.io/sub-bucket-path";

/// Field holding the serialized default values
pub const VALUES_FIELD: &str = "values";
/// Field holding the serialized version index
pub const INDEX_FIELD: &str = "versions";

const MAX_NAME_PREFIX: usize = 230;

/// Content bucket of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Templates,
    SchemaDefs,
    DefaultValues,
    Index,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Templates => "templates",
            Self::SchemaDefs => "schema-defs",
            Self::DefaultValues => "default-values",
            Self::Index => "index",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite identity of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub registry: String,
    pub package: String,
    /// Absent for the per-package index
    pub version: Option<String>,
    pub bucket: Bucket,
    pub sub_bucket: Option<String>,
}

impl ArtifactKey {
    pub fn new(registry: &str, package: &str, version: &Version, bucket: Bucket) -> Self {
        Self {
            registry: registry.to_string(),
            package: package.to_string(),
            version: Some(version.to_string()),
            bucket,
            sub_bucket: None,
        }
    }

    pub fn index(registry: &str, package: &str) -> Self {
        Self {
            registry: registry.to_string(),
            package: package.to_string(),
            version: None,
            bucket: Bucket::Index,
            sub_bucket: None,
        }
    }

    pub fn with_sub_bucket(&self, sub_bucket: &str) -> Self {
        Self {
            sub_bucket: Some(sub_bucket.to_string()),
            ..self.clone()
        }
    }

    /// Selector matching the bucket's root and sub-bucket artifacts
    pub fn bucket_selector(&self) -> LabelSelector {
        let selector = LabelSelector::new()
            .label(REGISTRY_LABEL, sanitize_label_value(&self.registry))
            .label(PACKAGE_LABEL, sanitize_label_value(&self.package))
            .label(BUCKET_LABEL, self.bucket.as_str());
        match &self.version {
            Some(version) => selector.label(VERSION_LABEL, sanitize_label_value(version)),
            None => selector,
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(REGISTRY_LABEL.to_string(), sanitize_label_value(&self.registry));
        labels.insert(PACKAGE_LABEL.to_string(), sanitize_label_value(&self.package));
        labels.insert(BUCKET_LABEL.to_string(), self.bucket.as_str().to_string());
        if let Some(version) = &self.version {
            labels.insert(VERSION_LABEL.to_string(), sanitize_label_value(version));
        }
        if let Some(sub) = &self.sub_bucket {
            labels.insert(SUB_BUCKET_LABEL.to_string(), sanitize_label_value(sub));
        }
        labels
    }

    /// Human-readable object name, unique per identity
    pub fn object_name(&self) -> String {
        let mut readable = format!("chart-{}-{}-{}", self.bucket, self.registry, self.package);
        if let Some(sub) = &self.sub_bucket {
            readable.push('-');
            readable.push_str(sub);
        }
        if let Some(version) = &self.version {
            readable.push('-');
            readable.push_str(version);
        }
        let mut prefix = sanitize_name(&readable);
        prefix.truncate(MAX_NAME_PREFIX);

        let mut hasher = Sha256::new();
        for part in [
            self.registry.as_str(),
            self.package.as_str(),
            self.version.as_deref().unwrap_or(""),
            self.bucket.as_str(),
            self.sub_bucket.as_deref().unwrap_or(""),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let hash = hex::encode(hasher.finalize());

        format!("{}-{}", prefix.trim_end_matches(['-', '.']), &hash[..10])
    }
}

/// `sha256:<hex>` over the sorted data fields
pub fn content_digest(data: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value);
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Package content read back from artifacts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChartContent {
    pub templates: Vec<PackageFile>,
    pub schema_defs: Vec<PackageFile>,
    pub default_values: Values,
}

/// Outcome of a write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Stale artifacts left over from an earlier write of the same version
    pub removed: usize,
    /// Files nested too deep to be stored, with their bucket
    pub dropped: Vec<String>,
}

enum PutOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Splits packages into artifacts and reassembles them
#[derive(Clone)]
pub struct ChartContentStore {
    store: Arc<dyn ObjectStore>,
    namespace: String,
}

impl ChartContentStore {
    pub fn new(store: Arc<dyn ObjectStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // ========== Write path ==========

    /// Store a package's templates, schema definitions and default values
    pub async fn write(
        &self,
        package: &PackageVersion,
        owner: Option<&OwnerRef>,
    ) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();
        let mut artifacts = Vec::new();
        let mut buckets = Vec::new();

        for (bucket, files) in [
            (Bucket::Templates, &package.templates),
            (Bucket::SchemaDefs, &package.schema_defs),
        ] {
            let base = ArtifactKey::new(&package.registry, package.name(), package.version(), bucket);
            let partition = partition(files);

            buckets.push(base.clone());
            artifacts.push((base.clone(), partition.root));
            for (sub, data) in partition.sub_buckets {
                artifacts.push((base.with_sub_bucket(&sub), data));
            }
            summary
                .dropped
                .extend(partition.dropped.into_iter().map(|f| format!("{bucket}/{f}")));
        }

        let values_key = ArtifactKey::new(
            &package.registry,
            package.name(),
            package.version(),
            Bucket::DefaultValues,
        );
        let mut values = BTreeMap::new();
        values.insert(VALUES_FIELD.to_string(), serde_json::to_vec(&package.default_values)?);
        buckets.push(values_key.clone());
        artifacts.push((values_key, values));

        let mut written = BTreeSet::new();
        for (key, data) in artifacts {
            written.insert(key.object_name());
            match self.put(&key, data, owner).await? {
                PutOutcome::Created => summary.created += 1,
                PutOutcome::Updated => summary.updated += 1,
                PutOutcome::Unchanged => summary.unchanged += 1,
            }
        }

        for base in &buckets {
            summary.removed += self.prune(base, &written).await?;
        }

        for file in &summary.dropped {
            tracing::warn!(package = %package.key(), file = %file, "file nested too deep, not stored");
        }
        tracing::info!(
            package = %package.key(),
            registry = %package.registry,
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            removed = summary.removed,
            "stored package content"
        );
        Ok(summary)
    }

    /// Store the version index of a package
    pub async fn write_index<T: Serialize>(
        &self,
        registry: &str,
        package: &str,
        entries: &[T],
        owner: Option<&OwnerRef>,
    ) -> Result<()> {
        let mut data = BTreeMap::new();
        data.insert(INDEX_FIELD.to_string(), serde_json::to_vec(entries)?);
        self.put(&ArtifactKey::index(registry, package), data, owner).await?;
        Ok(())
    }

    /// Delete artifacts of the bucket that were not part of the latest write
    async fn prune(&self, base: &ArtifactKey, written: &BTreeSet<String>) -> Result<usize> {
        let existing = self
            .store
            .list(ObjectKind::Artifact, &self.namespace, &base.bucket_selector())
            .await?;

        let mut removed = 0;
        for artifact in existing.iter().filter(|a| !written.contains(&a.name)) {
            tracing::debug!(artifact = %artifact.name, bucket = %base.bucket, "removing stale artifact");
            self.store.delete(&artifact.key()).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn put(
        &self,
        key: &ArtifactKey,
        data: BTreeMap<String, Vec<u8>>,
        owner: Option<&OwnerRef>,
    ) -> Result<PutOutcome> {
        let digest = content_digest(&data);
        let mut object = StoredObject::new(ObjectKind::Artifact, &self.namespace, key.object_name())
            .with_owner(owner);
        object.labels = key.labels();
        object.annotations.insert(DIGEST_ANNOTATION.to_string(), digest.clone());
        if let Some(sub) = &key.sub_bucket {
            object
                .annotations
                .insert(SUB_BUCKET_PATH_ANNOTATION.to_string(), sub.clone());
        }
        object.data = data;

        match self.store.find(&object.key()).await? {
            Some(existing) if existing.annotations.get(DIGEST_ANNOTATION) == Some(&digest) => {
                tracing::debug!(artifact = %object.name, "artifact unchanged");
                Ok(PutOutcome::Unchanged)
            }
            Some(existing) => {
                object.resource_version = existing.resource_version;
                self.store.update(&object).await?;
                Ok(PutOutcome::Updated)
            }
            None => {
                self.store.create(&object).await?;
                Ok(PutOutcome::Created)
            }
        }
    }

    // ========== Read path ==========

    /// Reassemble a package's content from its artifacts.
    ///
    /// The three buckets are fetched concurrently. A missing templates root
    /// artifact means the package is not stored; missing default values read
    /// as an empty map.
    pub async fn read_content(
        &self,
        registry: &str,
        package: &str,
        version: &Version,
    ) -> Result<ChartContent> {
        let buffer = Mutex::new(ChartContent::default());

        let (has_templates, _, _) = futures::try_join!(
            self.fetch_files(ArtifactKey::new(registry, package, version, Bucket::Templates), &buffer),
            self.fetch_files(ArtifactKey::new(registry, package, version, Bucket::SchemaDefs), &buffer),
            self.fetch_values(
                ArtifactKey::new(registry, package, version, Bucket::DefaultValues),
                &buffer
            ),
        )?;

        if !has_templates {
            return Err(KubeError::ContentNotFound {
                registry: registry.to_string(),
                package: package.to_string(),
                version: version.to_string(),
            });
        }

        let mut content = buffer.into_inner().unwrap_or_else(PoisonError::into_inner);
        content.templates.sort_by(|a, b| a.name.cmp(&b.name));
        content.schema_defs.sort_by(|a, b| a.name.cmp(&b.name));

        tracing::debug!(
            package = %package,
            version = %version,
            templates = content.templates.len(),
            schema_defs = content.schema_defs.len(),
            "loaded package content"
        );
        Ok(content)
    }

    /// Load a package given its metadata (typically from an index entry)
    pub async fn load(&self, registry: &str, metadata: PackageMetadata) -> Result<PackageVersion> {
        let content = self
            .read_content(registry, &metadata.name, &metadata.version)
            .await?;

        let mut package = PackageVersion::new(metadata, registry);
        package.templates = content.templates;
        package.schema_defs = content.schema_defs;
        package.default_values = content.default_values;
        Ok(package)
    }

    /// Read a package's version index, if stored
    pub async fn read_index<T: DeserializeOwned>(
        &self,
        registry: &str,
        package: &str,
    ) -> Result<Option<Vec<T>>> {
        let key = ArtifactKey::index(registry, package);
        let artifacts = self.list_verified(&key).await?;

        let Some(artifact) = artifacts.first() else {
            return Ok(None);
        };
        let raw = artifact
            .data
            .get(INDEX_FIELD)
            .ok_or_else(|| KubeError::InvalidObject {
                name: artifact.name.clone(),
                message: format!("missing '{INDEX_FIELD}' field"),
            })?;
        Ok(Some(serde_json::from_slice(raw)?))
    }

    /// Fetch one bucket into the shared buffer; returns whether a root artifact exists
    async fn fetch_files(&self, key: ArtifactKey, buffer: &Mutex<ChartContent>) -> Result<bool> {
        let artifacts = self.list_verified(&key).await?;
        let mut has_root = false;

        for artifact in artifacts {
            let sub_path = match artifact.labels.get(SUB_BUCKET_LABEL) {
                Some(label) => Some(
                    artifact
                        .annotations
                        .get(SUB_BUCKET_PATH_ANNOTATION)
                        .cloned()
                        .unwrap_or_else(|| label.clone()),
                ),
                None => {
                    has_root = true;
                    None
                }
            };

            let files = artifact.data.into_iter().map(|(name, data)| PackageFile {
                name: match &sub_path {
                    Some(sub) => format!("{sub}/{name}"),
                    None => name,
                },
                data,
            });

            let mut content = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            match key.bucket {
                Bucket::SchemaDefs => content.schema_defs.extend(files),
                _ => content.templates.extend(files),
            }
        }

        Ok(has_root)
    }

    async fn fetch_values(&self, key: ArtifactKey, buffer: &Mutex<ChartContent>) -> Result<()> {
        let artifacts = self.list_verified(&key).await?;

        let values = match artifacts.first().and_then(|a| a.data.get(VALUES_FIELD)) {
            Some(raw) => Values::from_value(serde_json::from_slice(raw)?),
            None => {
                tracing::debug!(package = %key.package, "no default values artifact, using empty values");
                Values::new()
            }
        };

        buffer.lock().unwrap_or_else(PoisonError::into_inner).default_values = values;
        Ok(())
    }

    async fn list_verified(&self, key: &ArtifactKey) -> Result<Vec<StoredObject>> {
        let artifacts = self
            .store
            .list(ObjectKind::Artifact, &self.namespace, &key.bucket_selector())
            .await?;

        for artifact in &artifacts {
            verify(artifact)?;
        }
        Ok(artifacts)
    }

    /// Key of the stored artifact, for diagnostics
    pub fn artifact_object_key(&self, key: &ArtifactKey) -> ObjectKey {
        ObjectKey::new(ObjectKind::Artifact, self.namespace.clone(), key.object_name())
    }
}

fn verify(artifact: &StoredObject) -> Result<()> {
    let Some(expected) = artifact.annotations.get(DIGEST_ANNOTATION) else {
        tracing::debug!(artifact = %artifact.name, "artifact has no digest, skipping verification");
        return Ok(());
    };

    let actual = content_digest(&artifact.data);
    if &actual != expected {
        return Err(KubeError::IntegrityCheckFailed {
            name: artifact.name.clone(),
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}

struct Partition {
    root: BTreeMap<String, Vec<u8>>,
    sub_buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    dropped: Vec<String>,
}

/// Group files by depth below the bucket root
fn partition(files: &[PackageFile]) -> Partition {
    let mut partition = Partition {
        root: BTreeMap::new(),
        sub_buckets: BTreeMap::new(),
        dropped: Vec::new(),
    };

    for file in files {
        let segments: Vec<&str> = file.name.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [name] => {
                partition.root.insert((*name).to_string(), file.data.clone());
            }
            [sub, name] => {
                partition
                    .sub_buckets
                    .entry((*sub).to_string())
                    .or_default()
                    .insert((*name).to_string(), file.data.clone());
            }
            _ => partition.dropped.push(file.name.clone()),
        }
    }

    partition
}
