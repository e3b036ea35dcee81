//! Values references and their composition
//!
//! A values reference is a stored configuration fragment that can pull in
//! other references under a dot-separated key:
//!
//! ```text
//! frontend            values: {replicas: 2}
//!   refs:
//!     ingress.tls  -> tls-prod
//! tls-prod            values: {secretName: wildcard}
//! ```
//!
//! composes to `{replicas: 2, ingress: {tls: {secretName: wildcard}}}`.
//!
//! Composition runs in two phases. The reference forest is first collected
//! from the store, one task per root, depth first, guarded by a visited set
//! on the current path and a depth limit. Each tree is then folded bottom-up,
//! and the root results are merged in declaration order so later roots win.

use chartplane_core::config::{OverflowPolicy, ValuesConfig};
use chartplane_core::Values;
use futures::future::{BoxFuture, FutureExt, join_all};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{KubeError, Result};
use crate::store::{ObjectKey, ObjectKind, ObjectStore, StoredObject};

/// Annotation listing the releases that use a reference (comma separated)
pub const RELEASES_ANNOTATION: &str = "chartplane.io/releases";

/// Field holding the reference payload
pub const VALUES_FIELD: &str = "values";
/// Field holding the child reference map
pub const REFS_FIELD: &str = "refs";

/// Parent recorded for root references
pub const BASE_PARENT: &str = "base";

/// Attempts at recording a release on one reference before giving up
const RECORD_ATTEMPTS: usize = 5;

/// A stored configuration fragment
#[derive(Debug, Clone, PartialEq)]
pub struct ValuesRef {
    pub name: String,
    pub values: Values,
    /// Key path in this fragment -> child reference name
    pub refs: IndexMap<String, String>,
    pub releases: BTreeSet<String>,
}

impl ValuesRef {
    pub fn new(name: impl Into<String>, values: Values) -> Self {
        Self {
            name: name.into(),
            values,
            refs: IndexMap::new(),
            releases: BTreeSet::new(),
        }
    }

    pub fn with_ref(mut self, key: impl Into<String>, child: impl Into<String>) -> Self {
        self.refs.insert(key.into(), child.into());
        self
    }

    pub fn from_object(object: &StoredObject) -> Result<Self> {
        let values = match object.data.get(VALUES_FIELD) {
            Some(raw) => Values::from_value(serde_json::from_slice(raw)?),
            None => Values::new(),
        };
        let refs = match object.data.get(REFS_FIELD) {
            Some(raw) => serde_json::from_slice(raw)?,
            None => IndexMap::new(),
        };
        let releases = object
            .annotations
            .get(RELEASES_ANNOTATION)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name: object.name.clone(),
            values,
            refs,
            releases,
        })
    }

    pub fn to_object(&self, namespace: &str) -> Result<StoredObject> {
        let mut object = StoredObject::new(ObjectKind::ValuesRef, namespace, &self.name)
            .with_data(VALUES_FIELD, serde_json::to_vec(&self.values)?)
            .with_data(REFS_FIELD, serde_json::to_vec(&self.refs)?);
        if !self.releases.is_empty() {
            object.annotations.insert(
                RELEASES_ANNOTATION.to_string(),
                self.releases.iter().cloned().collect::<Vec<_>>().join(","),
            );
        }
        Ok(object)
    }
}

/// Why a branch was left out of a composition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowKind {
    Cycle,
    Depth,
}

impl fmt::Display for OverflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle => f.write_str("cyclic"),
            Self::Depth => f.write_str("nested too deep"),
        }
    }
}

/// A reference branch that was dropped from a composition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceOverflow {
    pub reference: String,
    pub parent: String,
    pub depth: usize,
    pub kind: OverflowKind,
    /// Reference chain leading to the dropped branch
    pub path: Vec<String>,
}

impl ReferenceOverflow {
    fn into_error(self) -> KubeError {
        let mut chain = self.path;
        chain.push(self.reference.clone());
        KubeError::CyclicOrTooDeepReference {
            reference: self.reference,
            depth: self.depth,
            kind: self.kind,
            path: chain.join(" -> "),
        }
    }
}

/// Result of composing a release's references
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposedValues {
    pub values: Values,
    /// Branches dropped for cycles or depth
    pub overflows: Vec<ReferenceOverflow>,
    /// Roots that do not exist
    pub missing_roots: Vec<String>,
    /// Every reference that contributed
    pub visited: BTreeSet<String>,
}

/// One collected reference and its resolved children
#[derive(Debug)]
struct RefNode {
    reference: ValuesRef,
    children: Vec<(String, RefNode)>,
}

impl RefNode {
    fn compose(self) -> Result<Values> {
        let mut values = self.reference.values;
        for (key, child) in self.children {
            let child_values = child.compose()?;
            values.merge_at(&key, &child_values)?;
        }
        Ok(values)
    }

    fn names(&self, into: &mut BTreeSet<String>) {
        into.insert(self.reference.name.clone());
        for (_, child) in &self.children {
            child.names(into);
        }
    }
}

/// Resolves values references into one merged tree
#[derive(Clone)]
pub struct ValuesComposer {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    config: ValuesConfig,
}

impl ValuesComposer {
    pub fn new(store: Arc<dyn ObjectStore>, namespace: impl Into<String>, config: ValuesConfig) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            config,
        }
    }

    /// Create or replace a reference
    pub async fn put(&self, reference: &ValuesRef) -> Result<ValuesRef> {
        let stored = self.store.apply(&reference.to_object(&self.namespace)?).await?;
        ValuesRef::from_object(&stored)
    }

    pub async fn get(&self, name: &str) -> Result<Option<ValuesRef>> {
        self.store
            .find(&self.key(name))
            .await?
            .map(|object| ValuesRef::from_object(&object))
            .transpose()
    }

    /// Compose the values of `release` from its root references.
    ///
    /// Missing roots are skipped; a missing child reference is an error.
    /// Every contributing reference is annotated with the release name.
    pub async fn compose(&self, release: &str, roots: &[String]) -> Result<ComposedValues> {
        let composed = self.preview(roots).await?;
        self.record_release(release, &composed.visited).await?;

        tracing::debug!(
            release = %release,
            roots = roots.len(),
            references = composed.visited.len(),
            overflows = composed.overflows.len(),
            "composed values"
        );
        Ok(composed)
    }

    /// Compose root references without recording a release on them
    pub async fn preview(&self, roots: &[String]) -> Result<ComposedValues> {
        let overflows = Mutex::new(Vec::new());

        let trees = join_all(roots.iter().map(|root| {
            self.collect(root.clone(), BASE_PARENT.to_string(), Vec::new(), &overflows)
        }))
        .await;

        let mut composed = ComposedValues {
            values: Values::new(),
            ..Default::default()
        };

        for (root, tree) in roots.iter().zip(trees) {
            match tree {
                Ok(Some(node)) => {
                    node.names(&mut composed.visited);
                    let values = node.compose()?;
                    composed.values.merge(&values);
                }
                Ok(None) => {}
                Err(e) if e.is_not_found() => {
                    tracing::warn!(reference = %root, "root values reference not found, skipping");
                    composed.missing_roots.push(root.clone());
                }
                Err(e) => return Err(e),
            }
        }

        composed.overflows = overflows.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok(composed)
    }

    /// Depth-first collection of one reference and its children.
    ///
    /// `path` holds the references above this one. Returns `None` when the
    /// branch is dropped.
    fn collect<'a>(
        &'a self,
        name: String,
        parent: String,
        path: Vec<String>,
        overflows: &'a Mutex<Vec<ReferenceOverflow>>,
    ) -> BoxFuture<'a, Result<Option<RefNode>>> {
        async move {
            // Roots sit at depth 1
            let depth = path.len() + 1;
            let overflow = if path.contains(&name) {
                Some(OverflowKind::Cycle)
            } else if depth > self.config.max_depth {
                Some(OverflowKind::Depth)
            } else {
                None
            };

            if let Some(kind) = overflow {
                let dropped = ReferenceOverflow {
                    reference: name,
                    parent,
                    depth,
                    kind,
                    path,
                };
                if self.config.overflow == OverflowPolicy::Fail {
                    return Err(dropped.into_error());
                }
                tracing::warn!(
                    reference = %dropped.reference,
                    parent = %dropped.parent,
                    depth = dropped.depth,
                    reason = %dropped.kind,
                    "dropping values reference"
                );
                overflows
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(dropped);
                return Ok(None);
            }

            let object = self.store.get(&self.key(&name)).await.map_err(|e| {
                if e.is_not_found() && parent != BASE_PARENT {
                    KubeError::ValuesRefNotFound {
                        name: name.clone(),
                        parent: parent.clone(),
                    }
                } else {
                    e
                }
            })?;
            let reference = ValuesRef::from_object(&object)?;
            tracing::trace!(reference = %name, parent = %parent, depth, "collected values reference");

            let mut child_path = path;
            child_path.push(name.clone());

            let mut children = Vec::with_capacity(reference.refs.len());
            for (key, child) in &reference.refs {
                if let Some(node) = self
                    .collect(child.clone(), name.clone(), child_path.clone(), overflows)
                    .await?
                {
                    children.push((key.clone(), node));
                }
            }

            Ok(Some(RefNode {
                reference,
                children,
            }))
        }
        .boxed()
    }

    /// Add `release` to the releases annotation of each reference
    async fn record_release(&self, release: &str, names: &BTreeSet<String>) -> Result<()> {
        for name in names {
            self.record_on(release, name).await?;
        }
        Ok(())
    }

    /// Read-merge-update of one annotation, retried when another release
    /// updated the reference in between
    async fn record_on(&self, release: &str, name: &str) -> Result<()> {
        for attempt in 1..=RECORD_ATTEMPTS {
            let Some(mut object) = self.store.find(&self.key(name)).await? else {
                return Ok(());
            };
            let mut reference = ValuesRef::from_object(&object)?;
            if !reference.releases.insert(release.to_string()) {
                return Ok(());
            }
            object.annotations.insert(
                RELEASES_ANNOTATION.to_string(),
                reference.releases.into_iter().collect::<Vec<_>>().join(","),
            );

            match self.store.update(&object).await {
                Ok(_) => return Ok(()),
                Err(KubeError::Conflict { .. }) => {
                    tracing::debug!(reference = %name, release = %release, attempt, "reference changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            reference = %name,
            release = %release,
            attempts = RECORD_ATTEMPTS,
            "could not record release on values reference"
        );
        Ok(())
    }

    fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::new(ObjectKind::ValuesRef, self.namespace.clone(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LabelSelector, MockObjectStore, WatchEvent};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use serde_json::json;

    /// Yields to the scheduler before every call so concurrent tasks interleave
    struct YieldingStore(MockObjectStore);

    #[async_trait]
    impl ObjectStore for YieldingStore {
        async fn get(&self, key: &ObjectKey) -> Result<StoredObject> {
            tokio::task::yield_now().await;
            self.0.get(key).await
        }

        async fn list(
            &self,
            kind: ObjectKind,
            namespace: &str,
            selector: &LabelSelector,
        ) -> Result<Vec<StoredObject>> {
            tokio::task::yield_now().await;
            self.0.list(kind, namespace, selector).await
        }

        async fn create(&self, object: &StoredObject) -> Result<StoredObject> {
            tokio::task::yield_now().await;
            self.0.create(object).await
        }

        async fn update(&self, object: &StoredObject) -> Result<StoredObject> {
            tokio::task::yield_now().await;
            self.0.update(object).await
        }

        async fn delete(&self, key: &ObjectKey) -> Result<()> {
            tokio::task::yield_now().await;
            self.0.delete(key).await
        }

        async fn watch(
            &self,
            key: &ObjectKey,
            since: Option<&str>,
        ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
            self.0.watch(key, since).await
        }
    }

    fn composer(config: ValuesConfig) -> ValuesComposer {
        ValuesComposer::new(Arc::new(MockObjectStore::new()), "default", config)
    }

    fn roots(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_single_ref_without_children() {
        let composer = composer(ValuesConfig::default());
        composer
            .put(&ValuesRef::new("r1", Values(json!({"foo": "bar"}))))
            .await
            .unwrap();

        let composed = composer.compose("web", &roots(&["r1"])).await.unwrap();
        assert_eq!(composed.values.0, json!({"foo": "bar"}));
    }

    #[tokio::test]
    async fn test_child_nested_under_its_key() {
        let composer = composer(ValuesConfig::default());
        composer
            .put(&ValuesRef::new("r1", Values::new()).with_ref("ref", "r2"))
            .await
            .unwrap();
        composer
            .put(&ValuesRef::new("r2", Values(json!({"foo": "bar"}))))
            .await
            .unwrap();

        let composed = composer.compose("web", &roots(&["r1"])).await.unwrap();
        assert_eq!(composed.values.0, json!({"ref": {"foo": "bar"}}));
    }

    #[tokio::test]
    async fn test_child_overrides_parent_at_dotted_key() {
        let composer = composer(ValuesConfig::default());
        composer
            .put(
                &ValuesRef::new(
                    "frontend",
                    Values(json!({"ingress": {"tls": {"secretName": "default", "enabled": true}}})),
                )
                .with_ref("ingress.tls", "tls-prod"),
            )
            .await
            .unwrap();
        composer
            .put(&ValuesRef::new("tls-prod", Values(json!({"secretName": "wildcard"}))))
            .await
            .unwrap();

        let composed = composer.compose("web", &roots(&["frontend"])).await.unwrap();
        assert_eq!(
            composed.values.0,
            json!({"ingress": {"tls": {"secretName": "wildcard", "enabled": true}}})
        );
    }

    #[tokio::test]
    async fn test_no_roots_is_empty_map() {
        let composer = composer(ValuesConfig::default());
        let composed = composer.compose("web", &[]).await.unwrap();
        assert_eq!(composed.values.0, json!({}));
    }

    #[tokio::test]
    async fn test_later_roots_win() {
        let composer = composer(ValuesConfig::default());
        composer
            .put(&ValuesRef::new("a", Values(json!({"replicas": 1, "image": {"tag": "a"}}))))
            .await
            .unwrap();
        composer
            .put(&ValuesRef::new("b", Values(json!({"replicas": 3}))))
            .await
            .unwrap();

        for _ in 0..5 {
            let composed = composer.compose("web", &roots(&["a", "b"])).await.unwrap();
            assert_eq!(composed.values.0, json!({"replicas": 3, "image": {"tag": "a"}}));
        }
        let composed = composer.compose("web", &roots(&["b", "a"])).await.unwrap();
        assert_eq!(composed.values.0["replicas"], json!(1));
    }

    async fn chain(composer: &ValuesComposer, length: usize) {
        for level in 1..=length {
            let mut reference = ValuesRef::new(format!("r{level}"), Values(json!({"level": level})));
            if level < length {
                reference = reference.with_ref("next", format!("r{}", level + 1));
            }
            composer.put(&reference).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_depth_guard_drops_deepest_reference() {
        let composer = composer(ValuesConfig::default());
        chain(&composer, 11).await;

        let composed = composer.compose("web", &roots(&["r1"])).await.unwrap();

        let mut cursor = &composed.values.0;
        for level in 1..10 {
            assert_eq!(cursor["level"], json!(level));
            cursor = &cursor["next"];
        }
        assert_eq!(cursor["level"], json!(10));
        assert!(cursor.get("next").is_none());

        assert_eq!(composed.overflows.len(), 1);
        assert_eq!(composed.overflows[0].reference, "r11");
        assert_eq!(composed.overflows[0].kind, OverflowKind::Depth);
    }

    #[tokio::test]
    async fn test_depth_guard_fail_policy() {
        let composer = composer(ValuesConfig {
            overflow: OverflowPolicy::Fail,
            ..ValuesConfig::default()
        });
        chain(&composer, 11).await;

        let err = composer.compose("web", &roots(&["r1"])).await.unwrap_err();
        assert!(matches!(
            err,
            KubeError::CyclicOrTooDeepReference {
                kind: OverflowKind::Depth,
                depth: 11,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cycle_is_reported_not_followed() {
        let composer = composer(ValuesConfig::default());
        composer
            .put(&ValuesRef::new("a", Values(json!({"name": "a"}))).with_ref("child", "b"))
            .await
            .unwrap();
        composer
            .put(&ValuesRef::new("b", Values(json!({"name": "b"}))).with_ref("back", "a"))
            .await
            .unwrap();

        let composed = composer.compose("web", &roots(&["a"])).await.unwrap();
        assert_eq!(composed.values.0, json!({"name": "a", "child": {"name": "b"}}));
        assert_eq!(composed.overflows.len(), 1);
        assert_eq!(composed.overflows[0].kind, OverflowKind::Cycle);
        assert_eq!(composed.overflows[0].path, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_shared_child_is_composed_per_path() {
        let composer = composer(ValuesConfig::default());
        composer
            .put(
                &ValuesRef::new("app", Values::new())
                    .with_ref("primary", "db")
                    .with_ref("replica", "db"),
            )
            .await
            .unwrap();
        composer
            .put(&ValuesRef::new("db", Values(json!({"port": 5432}))))
            .await
            .unwrap();

        let composed = composer.compose("web", &roots(&["app"])).await.unwrap();
        assert_eq!(
            composed.values.0,
            json!({"primary": {"port": 5432}, "replica": {"port": 5432}})
        );
        assert!(composed.overflows.is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_skipped_missing_child_fails() {
        let composer = composer(ValuesConfig::default());
        composer
            .put(&ValuesRef::new("present", Values(json!({"a": 1}))))
            .await
            .unwrap();

        let composed = composer
            .compose("web", &roots(&["absent", "present"]))
            .await
            .unwrap();
        assert_eq!(composed.values.0, json!({"a": 1}));
        assert_eq!(composed.missing_roots, vec!["absent"]);

        composer
            .put(&ValuesRef::new("broken", Values::new()).with_ref("x", "nowhere"))
            .await
            .unwrap();
        let err = composer.compose("web", &roots(&["broken"])).await.unwrap_err();
        assert!(matches!(err, KubeError::ValuesRefNotFound { ref name, .. } if name == "nowhere"));
    }

    #[tokio::test]
    async fn test_concurrent_releases_share_a_reference() {
        let composer = ValuesComposer::new(
            Arc::new(YieldingStore(MockObjectStore::new())),
            "default",
            ValuesConfig::default(),
        );
        composer
            .put(&ValuesRef::new("shared", Values(json!({"a": 1}))))
            .await
            .unwrap();

        let shared = roots(&["shared"]);
        let (web, api) = tokio::join!(
            composer.compose("web", &shared),
            composer.compose("api", &shared)
        );
        assert_eq!(web.unwrap().values.0, json!({"a": 1}));
        assert_eq!(api.unwrap().values.0, json!({"a": 1}));

        let stored = composer.get("shared").await.unwrap().unwrap();
        assert_eq!(
            stored.releases.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["api", "web"]
        );
    }

    #[tokio::test]
    async fn test_preview_records_nothing() {
        let composer = composer(ValuesConfig::default());
        composer
            .put(&ValuesRef::new("shared", Values(json!({"a": 1}))))
            .await
            .unwrap();

        let composed = composer.preview(&roots(&["shared"])).await.unwrap();
        assert_eq!(composed.values.0, json!({"a": 1}));
        assert!(composer.get("shared").await.unwrap().unwrap().releases.is_empty());
    }

    #[tokio::test]
    async fn test_releases_annotation_accumulates() {
        let composer = composer(ValuesConfig::default());
        composer
            .put(&ValuesRef::new("shared", Values::new()).with_ref("tls", "certs"))
            .await
            .unwrap();
        composer
            .put(&ValuesRef::new("certs", Values::new()))
            .await
            .unwrap();

        composer.compose("web", &roots(&["shared"])).await.unwrap();
        composer.compose("api", &roots(&["shared"])).await.unwrap();
        composer.compose("api", &roots(&["shared"])).await.unwrap();

        for name in ["shared", "certs"] {
            let stored = composer.get(name).await.unwrap().unwrap();
            assert_eq!(
                stored.releases.iter().map(String::as_str).collect::<Vec<_>>(),
                vec!["api", "web"]
            );
        }
    }
}
