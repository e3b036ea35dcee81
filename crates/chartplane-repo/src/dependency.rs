//! Dependency graph resolution
//!
//! Walks a package's declared dependencies in declaration order. Each
//! dependency's condition is evaluated against the parent's composed values;
//! included dependencies are resolved against their registry's index,
//! loaded, resolved recursively and attached to the parent. Resolution is
//! sequential: every dependency of a package sees the same values, and
//! index lookups share one [`IndexCache`].

use chartplane_core::{ConditionOutcome, Dependency, PackageVersion, Values};
use chartplane_kube::content::{PACKAGE_LABEL, REGISTRY_LABEL, VERSION_LABEL};
use chartplane_kube::store::{sanitize_label_value, sanitize_name};
use chartplane_kube::{ObjectKind, StoredObject, SubResourceSyncWatcher, SyncOutcome};
use futures::future::{BoxFuture, FutureExt};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::config::{Registry, RegistryCatalog, RegistryMatch};
use crate::error::{RepoError, Result};
use crate::index::resolve_entries;
use crate::source::{IndexCache, PackageSource};

/// Field holding a package resource's spec
pub const SPEC_FIELD: &str = "spec";

/// What happened to one declared dependency
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyStatus {
    Included {
        version: Version,
        registry: String,
        matched: RegistryMatch,
    },
    /// The condition holds `false`
    Excluded { condition: String },
    /// The condition holds a non-boolean; treated as `false`
    Unparsable { condition: String, value: String },
    /// The condition path has an unsupported shape; the dependency is skipped
    InvalidCondition { condition: String },
}

/// One node of a resolution report
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyNode {
    pub name: String,
    pub alias: Option<String>,
    pub constraint: String,
    pub status: DependencyStatus,
    pub children: Vec<DependencyNode>,
}

impl DependencyNode {
    pub fn is_included(&self) -> bool {
        matches!(self.status, DependencyStatus::Included { .. })
    }
}

/// Outcome of resolving one package's dependency graph
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionReport {
    pub package: String,
    pub version: Version,
    pub dependencies: Vec<DependencyNode>,
}

impl ResolutionReport {
    /// Dependencies whose condition could not be used, at any depth
    pub fn condition_errors(&self) -> Vec<&DependencyNode> {
        fn collect<'a>(nodes: &'a [DependencyNode], into: &mut Vec<&'a DependencyNode>) {
            for node in nodes {
                if matches!(
                    node.status,
                    DependencyStatus::Unparsable { .. } | DependencyStatus::InvalidCondition { .. }
                ) {
                    into.push(node);
                }
                collect(&node.children, into);
            }
        }

        let mut errors = Vec::new();
        collect(&self.dependencies, &mut errors);
        errors
    }

    pub fn render_tree(&self) -> String {
        let mut lines = vec![format!("{}@{}", self.package, self.version)];
        let count = self.dependencies.len();
        for (i, node) in self.dependencies.iter().enumerate() {
            render_tree_node(node, &mut lines, "", i + 1 == count);
        }
        lines.join("\n")
    }
}

fn render_tree_node(node: &DependencyNode, lines: &mut Vec<String>, prefix: &str, is_last: bool) {
    let connector = if is_last { "└── " } else { "├── " };
    let name = match &node.alias {
        Some(alias) => format!("{} (alias: {})", node.name, alias),
        None => node.name.clone(),
    };

    let line = match &node.status {
        DependencyStatus::Included {
            version,
            registry,
            matched,
        } => match matched {
            RegistryMatch::Fallback => format!("{name}@{version} ({registry}, fallback)"),
            _ => format!("{name}@{version} ({registry})"),
        },
        DependencyStatus::Excluded { condition } => format!("{name} excluded by {condition}"),
        DependencyStatus::Unparsable { condition, value } => {
            format!("{name} excluded by {condition}: '{value}' is not a boolean")
        }
        DependencyStatus::InvalidCondition { condition } => {
            format!("{name} skipped: invalid condition '{condition}'")
        }
    };
    lines.push(format!("{prefix}{connector}{line}"));

    let child_prefix = format!("{}{}   ", prefix, if is_last { " " } else { "│" });
    let count = node.children.len();
    for (i, child) in node.children.iter().enumerate() {
        render_tree_node(child, lines, &child_prefix, i + 1 == count);
    }
}

/// Spec of a declared dependent package resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageResourceSpec {
    pub package: String,
    pub version: String,
    pub registry: String,
    pub values: Values,
}

/// Convergence of one dependent package resource
#[derive(Debug, Clone, PartialEq)]
pub struct DependencySync {
    pub package: String,
    pub resource: String,
    pub outcome: SyncOutcome,
}

/// Resolves and attaches package dependencies
#[derive(Clone)]
pub struct DependencyGraphResolver {
    source: PackageSource,
    catalog: RegistryCatalog,
}

impl DependencyGraphResolver {
    pub fn new(source: PackageSource, catalog: RegistryCatalog) -> Self {
        Self { source, catalog }
    }

    pub fn source(&self) -> &PackageSource {
        &self.source
    }

    pub fn catalog(&self) -> &RegistryCatalog {
        &self.catalog
    }

    /// Resolve `package`'s dependencies with a fresh index cache.
    ///
    /// `values` are the package's composed values. Previously attached
    /// sub-packages are replaced, so re-running on unchanged input gives the
    /// same result. On error the package is left as it was.
    pub async fn resolve(
        &self,
        package: &mut PackageVersion,
        registry: &Registry,
        values: &Values,
    ) -> Result<ResolutionReport> {
        let mut cache = IndexCache::new();
        self.resolve_with_cache(package, registry, values, &mut cache).await
    }

    pub async fn resolve_with_cache(
        &self,
        package: &mut PackageVersion,
        registry: &Registry,
        values: &Values,
        cache: &mut IndexCache,
    ) -> Result<ResolutionReport> {
        let mut chain = vec![package.name().to_string()];
        let dependencies = self
            .resolve_package(package, registry, values, &mut chain, cache)
            .await?;

        let report = ResolutionReport {
            package: package.name().to_string(),
            version: package.version().clone(),
            dependencies,
        };
        tracing::info!(
            package = %package.key(),
            attached = package.attached.len(),
            condition_errors = report.condition_errors().len(),
            "resolved dependencies"
        );
        Ok(report)
    }

    fn resolve_package<'a>(
        &'a self,
        package: &'a mut PackageVersion,
        registry: &'a Registry,
        values: &'a Values,
        chain: &'a mut Vec<String>,
        cache: &'a mut IndexCache,
    ) -> BoxFuture<'a, Result<Vec<DependencyNode>>> {
        async move {
            let parent = package.key();
            let dependencies = package.dependencies().to_vec();
            let mut nodes = Vec::with_capacity(dependencies.len());
            let mut attached = Vec::new();

            for dependency in &dependencies {
                let condition = dependency.condition.clone().unwrap_or_default();
                let outcome = dependency.evaluate_condition(values);
                if let Some(err) = outcome.to_error(dependency) {
                    tracing::warn!(package = %parent, error = %err, "dependency condition not usable");
                }

                let status = match outcome {
                    ConditionOutcome::Included => None,
                    ConditionOutcome::Excluded => Some(DependencyStatus::Excluded { condition }),
                    ConditionOutcome::Unparsable { value } => {
                        Some(DependencyStatus::Unparsable { condition, value })
                    }
                    ConditionOutcome::Invalid { .. } => {
                        Some(DependencyStatus::InvalidCondition { condition })
                    }
                };
                if let Some(status) = status {
                    tracing::debug!(package = %parent, dependency = %dependency.name, "dependency not included");
                    nodes.push(Self::node(dependency, status, Vec::new()));
                    continue;
                }

                let (source, matched) = self.catalog.resolve_source(registry, &dependency.repository);
                let mut sub = self
                    .load_dependency(dependency, source, cache)
                    .await
                    .map_err(|e| RepoError::dependency(&parent, &dependency.name, e))?;

                if chain.iter().any(|name| name == sub.name()) {
                    let mut cycle = chain.clone();
                    cycle.push(sub.name().to_string());
                    return Err(RepoError::DependencyCycle {
                        cycle: cycle.join(" -> "),
                    });
                }

                let sub_values = Values::for_dependency(
                    sub.default_values.clone(),
                    values,
                    dependency.effective_name(),
                );

                chain.push(sub.name().to_string());
                let children = self
                    .resolve_package(&mut sub, source, &sub_values, chain, cache)
                    .await
                    .map_err(|e| RepoError::dependency(&parent, &dependency.name, e))?;
                chain.pop();

                tracing::debug!(package = %parent, dependency = %sub.key(), registry = %source.name, "attached dependency");
                let status = DependencyStatus::Included {
                    version: sub.version().clone(),
                    registry: source.name.clone(),
                    matched,
                };
                sub.default_values = sub_values;
                attached.push(sub);
                nodes.push(Self::node(dependency, status, children));
            }

            // Replaced only once every dependency resolved
            package.attached = attached;
            Ok(nodes)
        }
        .boxed()
    }

    async fn load_dependency(
        &self,
        dependency: &Dependency,
        registry: &Registry,
        cache: &mut IndexCache,
    ) -> Result<PackageVersion> {
        let entries = self.source.entries(registry, &dependency.name, cache).await?;
        let entry = resolve_entries(&entries, &dependency.version)?.ok_or_else(|| {
            RepoError::VersionNotFound {
                name: dependency.name.clone(),
                constraint: dependency.version.clone(),
                registry: registry.name.clone(),
            }
        })?;
        self.source.load(registry, entry).await
    }

    fn node(dependency: &Dependency, status: DependencyStatus, children: Vec<DependencyNode>) -> DependencyNode {
        DependencyNode {
            name: dependency.name.clone(),
            alias: dependency.alias.clone(),
            constraint: dependency.version.clone(),
            status,
            children,
        }
    }

    /// Declare one package resource per attached dependency and wait for each
    /// to converge, in order. Timeouts are reported, not retried.
    pub async fn sync_dependency_resources(
        &self,
        parent: &StoredObject,
        package: &PackageVersion,
        watcher: &SubResourceSyncWatcher,
    ) -> Result<Vec<DependencySync>> {
        let owner = parent.owner_ref();
        let mut synced = Vec::with_capacity(package.attached.len());

        for sub in &package.attached {
            let spec = PackageResourceSpec {
                package: sub.name().to_string(),
                version: sub.version().to_string(),
                registry: sub.registry.clone(),
                values: sub.default_values.clone(),
            };
            let name = sanitize_name(&format!("{}-{}", parent.name, sub.name()));
            let resource = StoredObject::new(ObjectKind::PackageResource, &parent.namespace, &name)
                .with_label(PACKAGE_LABEL, sanitize_label_value(sub.name()))
                .with_label(VERSION_LABEL, sanitize_label_value(&spec.version))
                .with_label(REGISTRY_LABEL, sanitize_label_value(&sub.registry))
                .with_data(SPEC_FIELD, serde_json::to_vec(&spec)?)
                .with_owner(owner.as_ref());

            let outcome = watcher
                .declare_and_wait(&resource)
                .await
                .map_err(|e| RepoError::dependency(&package.key(), sub.name(), e.into()))?;
            if !outcome.is_converged() {
                tracing::warn!(package = %package.key(), dependency = %sub.key(), "dependency did not converge");
            }

            synced.push(DependencySync {
                package: sub.name().to_string(),
                resource: name,
                outcome,
            });
        }

        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartplane_core::config::SyncConfig;
    use chartplane_core::{PackageFile, PackageMetadata};
    use chartplane_kube::{ChartContentStore, MockObjectStore, ObjectKey, ObjectStore};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const STABLE_URL: &str = "https://charts.example.com/stable";
    const BITNAMI_URL: &str = "https://charts.bitnami.com/bitnami";

    fn package(name: &str, version: &str, defaults: serde_json::Value, deps: Vec<Dependency>) -> PackageVersion {
        let mut metadata = PackageMetadata::new(name, Version::parse(version).unwrap());
        metadata.dependencies = deps;
        let mut package = PackageVersion::new(metadata, "");
        package
            .templates
            .push(PackageFile::new(format!("{name}.yaml"), format!("name: {name}")));
        package.default_values = Values(defaults);
        package
    }

    fn catalog() -> RegistryCatalog {
        let mut catalog = RegistryCatalog::default();
        catalog
            .add(Registry::new("stable", STABLE_URL).unwrap().with_group("platform"))
            .unwrap();
        catalog
            .add(Registry::new("bitnami", BITNAMI_URL).unwrap().with_group("platform"))
            .unwrap();
        catalog
    }

    struct Fixture {
        store: MockObjectStore,
        resolver: DependencyGraphResolver,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = MockObjectStore::new();
            let content = ChartContentStore::new(Arc::new(store.clone()), "charts");
            let source = PackageSource::new(content);
            let catalog = catalog();

            let stable = catalog.get("stable").unwrap();
            let bitnami = catalog.get("bitnami").unwrap();

            let web = package(
                "web",
                "1.0.0",
                json!({"redis": {"enabled": true}}),
                vec![
                    Dependency::new("redis", "^17", BITNAMI_URL).with_condition("redis.enabled"),
                    Dependency::new("postgresql", "^12", BITNAMI_URL)
                        .with_condition("postgresql.enabled"),
                    Dependency::new("metrics", "*", STABLE_URL).with_condition("a.b.c"),
                ],
            );
            source.push(stable, web, None).await.unwrap();

            for version in ["17.0.0", "17.3.1", "18.0.0"] {
                let redis = package(
                    "redis",
                    version,
                    json!({"auth": {"enabled": true, "password": ""}, "replicas": 1}),
                    vec![Dependency::new("common", "~2.0", BITNAMI_URL)],
                );
                source.push(bitnami, redis, None).await.unwrap();
            }
            source
                .push(bitnami, package("common", "2.0.3", json!({"labels": {}}), vec![]), None)
                .await
                .unwrap();
            source
                .push(bitnami, package("postgresql", "12.1.0", json!({}), vec![]), None)
                .await
                .unwrap();

            Self {
                store,
                resolver: DependencyGraphResolver::new(source, catalog),
            }
        }

        async fn root(&self, name: &str, version: &str) -> PackageVersion {
            let stable = self.resolver.catalog().get("stable").unwrap();
            let mut cache = IndexCache::new();
            let entries = self.resolver.source().entries(stable, name, &mut cache).await.unwrap();
            let entry = resolve_entries(&entries, version).unwrap().unwrap();
            self.resolver.source().load(stable, entry).await.unwrap()
        }

        fn stable(&self) -> &Registry {
            self.resolver.catalog().get("stable").unwrap()
        }
    }

    fn parent_values() -> Values {
        Values(json!({
            "global": {"env": "prod"},
            "redis": {"enabled": true, "auth": {"password": "s3cret"}},
            "postgresql": {"enabled": false},
        }))
    }

    #[tokio::test]
    async fn test_resolves_included_dependencies_recursively() {
        let fixture = Fixture::new().await;
        let mut web = fixture.root("web", "1.0.0").await;

        let report = fixture
            .resolver
            .resolve(&mut web, fixture.stable(), &parent_values())
            .await
            .unwrap();

        assert_eq!(web.attached.len(), 1);
        let redis = web.attached("redis").unwrap();
        assert_eq!(redis.version().to_string(), "17.3.1");
        assert_eq!(redis.registry, "bitnami");
        assert_eq!(redis.attached("common").unwrap().version().to_string(), "2.0.3");

        assert_eq!(
            redis.default_values.0,
            json!({
                "auth": {"enabled": true, "password": "s3cret"},
                "replicas": 1,
                "enabled": true,
                "global": {"env": "prod"},
            })
        );
        assert_eq!(report.condition_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_render_tree() {
        let fixture = Fixture::new().await;
        let mut web = fixture.root("web", "1.0.0").await;
        let report = fixture
            .resolver
            .resolve(&mut web, fixture.stable(), &parent_values())
            .await
            .unwrap();

        insta::assert_snapshot!(report.render_tree(), @r"
        web@1.0.0
        ├── redis@17.3.1 (bitnami)
        │   └── common@2.0.3 (bitnami)
        ├── postgresql excluded by postgresql.enabled
        └── metrics skipped: invalid condition 'a.b.c'
        ");
    }

    #[tokio::test]
    async fn test_unparsable_condition_excludes_without_error() {
        let fixture = Fixture::new().await;
        let mut web = fixture.root("web", "1.0.0").await;
        let values = Values(json!({"redis": {"enabled": "not-a-bool"}, "postgresql": {"enabled": false}}));

        let report = fixture
            .resolver
            .resolve(&mut web, fixture.stable(), &values)
            .await
            .unwrap();

        assert!(web.attached.is_empty());
        assert_eq!(
            report.dependencies[0].status,
            DependencyStatus::Unparsable {
                condition: "redis.enabled".to_string(),
                value: "not-a-bool".to_string(),
            }
        );
        assert_eq!(report.condition_errors().len(), 2);
    }

    #[tokio::test]
    async fn test_absent_condition_includes() {
        let fixture = Fixture::new().await;
        let mut web = fixture.root("web", "1.0.0").await;

        fixture
            .resolver
            .resolve(&mut web, fixture.stable(), &Values::new())
            .await
            .unwrap();

        let names: Vec<_> = web.attached.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["redis", "postgresql"]);
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let fixture = Fixture::new().await;
        let mut web = fixture.root("web", "1.0.0").await;

        let first = fixture
            .resolver
            .resolve(&mut web, fixture.stable(), &parent_values())
            .await
            .unwrap();
        let attached = web.attached.clone();
        let second = fixture
            .resolver
            .resolve(&mut web, fixture.stable(), &parent_values())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(web.attached, attached);
    }

    #[tokio::test]
    async fn test_index_cache_shared_across_dependencies() {
        let fixture = Fixture::new().await;
        let mut web = fixture.root("web", "1.0.0").await;

        let mut cache = IndexCache::new();
        fixture
            .resolver
            .resolve_with_cache(&mut web, fixture.stable(), &Values::new(), &mut cache)
            .await
            .unwrap();
        // redis, common and postgresql
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_version_fails_naming_dependency() {
        let fixture = Fixture::new().await;
        let mut app = package(
            "app",
            "1.0.0",
            json!({}),
            vec![Dependency::new("redis", "^99", BITNAMI_URL)],
        );

        let err = fixture
            .resolver
            .resolve(&mut app, fixture.stable(), &Values::new())
            .await
            .unwrap_err();

        match &err {
            RepoError::DependencyResolutionFailed { dependency, .. } => assert_eq!(dependency, "redis"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(err.root_cause(), RepoError::VersionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_failed_resolution_keeps_attached_dependencies() {
        let fixture = Fixture::new().await;
        let mut app = package(
            "app",
            "1.0.0",
            json!({}),
            vec![
                Dependency::new("postgresql", "^12", BITNAMI_URL).with_condition("postgresql.enabled"),
                Dependency::new("redis", "^99", BITNAMI_URL).with_condition("redis.enabled"),
            ],
        );

        let values = Values(json!({"postgresql": {"enabled": true}, "redis": {"enabled": false}}));
        fixture
            .resolver
            .resolve(&mut app, fixture.stable(), &values)
            .await
            .unwrap();
        let before = app.attached.clone();
        assert_eq!(before.len(), 1);

        let values = Values(json!({"postgresql": {"enabled": false}}));
        fixture
            .resolver
            .resolve(&mut app, fixture.stable(), &values)
            .await
            .unwrap_err();
        assert_eq!(app.attached, before);
    }

    #[tokio::test]
    async fn test_dependency_cycle_detected() {
        let fixture = Fixture::new().await;
        let bitnami = fixture.resolver.catalog().get("bitnami").unwrap();
        fixture
            .resolver
            .source()
            .push(
                bitnami,
                package("loop-a", "1.0.0", json!({}), vec![Dependency::new("loop-b", "*", BITNAMI_URL)]),
                None,
            )
            .await
            .unwrap();
        fixture
            .resolver
            .source()
            .push(
                bitnami,
                package("loop-b", "1.0.0", json!({}), vec![Dependency::new("loop-a", "*", BITNAMI_URL)]),
                None,
            )
            .await
            .unwrap();

        let mut root = package(
            "root",
            "1.0.0",
            json!({}),
            vec![Dependency::new("loop-a", "*", BITNAMI_URL)],
        );
        let err = fixture
            .resolver
            .resolve(&mut root, fixture.stable(), &Values::new())
            .await
            .unwrap_err();

        match err.root_cause() {
            RepoError::DependencyCycle { cycle } => {
                assert_eq!(cycle, "root -> loop-a -> loop-b -> loop-a")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_registry_falls_back_to_parent() {
        let fixture = Fixture::new().await;
        let stable = fixture.stable();
        fixture
            .resolver
            .source()
            .push(stable, package("sidecar", "0.1.0", json!({}), vec![]), None)
            .await
            .unwrap();

        let mut app = package(
            "app",
            "1.0.0",
            json!({}),
            vec![Dependency::new("sidecar", "*", "https://unknown.example.com")],
        );
        let report = fixture
            .resolver
            .resolve(&mut app, stable, &Values::new())
            .await
            .unwrap();

        assert!(matches!(
            report.dependencies[0].status,
            DependencyStatus::Included {
                matched: RegistryMatch::Fallback,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_dependency_resources() {
        let fixture = Fixture::new().await;
        let mut web = fixture.root("web", "1.0.0").await;
        fixture
            .resolver
            .resolve(&mut web, fixture.stable(), &parent_values())
            .await
            .unwrap();

        let parent = fixture
            .store
            .create(&StoredObject::new(ObjectKind::PackageResource, "charts", "web"))
            .await
            .unwrap();
        let watcher = SubResourceSyncWatcher::new(
            Arc::new(fixture.store.clone()),
            SyncConfig {
                timeout: Duration::from_secs(10),
                ..SyncConfig::default()
            },
        );

        // A controller acknowledging the redis resource after a second
        let controller = fixture.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let key = ObjectKey::new(ObjectKind::PackageResource, "charts", "web-redis");
            let current = controller.get(&key).await.unwrap();
            controller.update(&current).await.unwrap();
        });

        let synced = fixture
            .resolver
            .sync_dependency_resources(&parent, &web, &watcher)
            .await
            .unwrap();

        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].resource, "web-redis");
        assert!(synced[0].outcome.is_converged());

        let stored = fixture.store.objects(ObjectKind::PackageResource);
        let resource = stored.iter().find(|o| o.name == "web-redis").unwrap();
        assert_eq!(resource.owner_references[0].name, "web");
        let spec: PackageResourceSpec =
            serde_json::from_slice(resource.data.get(SPEC_FIELD).unwrap()).unwrap();
        assert_eq!(spec.version, "17.3.1");
    }
}
