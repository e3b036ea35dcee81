//! Object store interface
//!
//! Everything the engine persists (content artifacts, values references,
//! dependent package resources) is a labeled byte-map object with owner
//! references. Two backends implement [`ObjectStore`]:
//!
//! - **ConfigMap**: objects live in Kubernetes ConfigMaps
//! - **Mock**: in-memory, with watch support, for tests

mod configmap;
mod mock;

pub use configmap::ConfigMapStore;
pub use mock::{MockObjectStore, OperationCounts};

use async_trait::async_trait;
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{KubeError, Result};

/// Label carrying the object kind
pub const KIND_LABEL: &str = "chartplane.io/kind";

/// API version used in owner references between engine objects
pub const OWNER_API_VERSION: &str = "v1";

/// Owner kind used in owner references between engine objects
pub const OWNER_KIND: &str = "ConfigMap";

/// Kinds of objects the engine stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// One bucket of a package's content
    Artifact,
    /// A named configuration fragment
    ValuesRef,
    /// A dependent package declared for another controller
    PackageResource,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Artifact => "artifact",
            Self::ValuesRef => "values-ref",
            Self::PackageResource => "package",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "artifact" => Some(Self::Artifact),
            "values-ref" => Some(Self::ValuesRef),
            "package" => Some(Self::PackageResource),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn not_found(&self) -> KubeError {
        KubeError::ObjectNotFound {
            kind: self.kind.to_string(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Reference to an owning object; owned objects are garbage collected with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// A labeled byte-map object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerRef>,
    pub data: BTreeMap<String, Vec<u8>>,
    /// Assigned by the store
    pub uid: Option<String>,
    /// Assigned by the store; updates must carry the version they were based on
    pub resource_version: Option<String>,
}

impl StoredObject {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner_references: Vec::new(),
            data: BTreeMap::new(),
            uid: None,
            resource_version: None,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind, self.namespace.clone(), self.name.clone())
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_owner(mut self, owner: Option<&OwnerRef>) -> Self {
        if let Some(owner) = owner {
            self.owner_references.push(owner.clone());
        }
        self
    }

    /// A data field as UTF-8
    pub fn field_str(&self, field: &str) -> Result<Option<&str>> {
        self.data
            .get(field)
            .map(|bytes| {
                std::str::from_utf8(bytes).map_err(|e| KubeError::InvalidObject {
                    name: self.name.clone(),
                    message: format!("field '{field}' is not UTF-8: {e}"),
                })
            })
            .transpose()
    }

    /// Reference to this object for use as an owner; requires a stored uid
    pub fn owner_ref(&self) -> Option<OwnerRef> {
        self.uid.as_ref().map(|uid| OwnerRef {
            api_version: OWNER_API_VERSION.to_string(),
            kind: OWNER_KIND.to_string(),
            name: self.name.clone(),
            uid: uid.clone(),
        })
    }
}

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// `k1=v1,k2=v2`
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A change observed on a watched object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(StoredObject),
    Modified(StoredObject),
    Deleted(StoredObject),
}

impl WatchEvent {
    pub fn object(&self) -> &StoredObject {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => o,
        }
    }
}

/// Object store backend
///
/// Implementations must be Send + Sync; one store is shared by all tasks.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get an object by key
    async fn get(&self, key: &ObjectKey) -> Result<StoredObject>;

    /// List objects of a kind in a namespace matching a label selector
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<StoredObject>>;

    /// Create an object; fails if it exists
    async fn create(&self, object: &StoredObject) -> Result<StoredObject>;

    /// Replace an existing object
    async fn update(&self, object: &StoredObject) -> Result<StoredObject>;

    /// Delete an object; deleting a missing object succeeds
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Watch a single object for changes after `since` (a resource version)
    async fn watch(
        &self,
        key: &ObjectKey,
        since: Option<&str>,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>>;

    /// Get an object, mapping "not found" to `None`
    async fn find(&self, key: &ObjectKey) -> Result<Option<StoredObject>> {
        match self.get(key).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create the object, or update it from its current version if it exists
    async fn apply(&self, object: &StoredObject) -> Result<StoredObject> {
        match self.find(&object.key()).await? {
            Some(existing) => {
                let mut desired = object.clone();
                desired.resource_version = existing.resource_version;
                desired.uid = existing.uid;
                self.update(&desired).await
            }
            None => self.create(object).await,
        }
    }
}

static LABEL_INVALID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("label pattern is a valid regex"));
static NAME_INVALID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9.-]+").expect("name pattern is a valid regex"));

/// Coerce a string into a valid label value (max 63 chars, alphanumeric ends)
pub fn sanitize_label_value(value: &str) -> String {
    let replaced = LABEL_INVALID.replace_all(value, "_");
    let truncated: String = replaced.chars().take(63).collect();
    truncated
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Coerce a string into a DNS-1123 subdomain fragment
pub fn sanitize_name(value: &str) -> String {
    let lowered = value.to_ascii_lowercase();
    let replaced = NAME_INVALID.replace_all(&lowered, "-");
    replaced
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_value_sanitizing() {
        assert_eq!(sanitize_label_value("1.2.0+build.5"), "1.2.0_build.5");
        assert_eq!(sanitize_label_value("-redis-"), "redis");
        assert_eq!(sanitize_label_value(&"a".repeat(80)).len(), 63);
    }

    #[test]
    fn test_name_sanitizing() {
        assert_eq!(sanitize_name("Chart_Templates/My App"), "chart-templates-my-app");
        assert_eq!(sanitize_name("1.2.0+build"), "1.2.0-build");
    }

    #[test]
    fn test_selector() {
        let selector = LabelSelector::new().label("b", "2").label("a", "1");
        assert_eq!(selector.to_query(), "a=1,b=2");

        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        assert!(!selector.matches(&labels));
        labels.insert("b".to_string(), "2".to_string());
        labels.insert("c".to_string(), "3".to_string());
        assert!(selector.matches(&labels));
    }
}
