//! Release planning
//!
//! Turns a release request into a fully resolved package: the version is
//! resolved from the registry index, the package is loaded, its defaults are
//! overlaid with the release's composed values references, and dependencies
//! are resolved against the result. The prepared release is then handed to a
//! [`ReleaseEngine`].

use chartplane_core::{PackageVersion, Values};
use chartplane_kube::{ComposedValues, ValuesComposer};

use crate::dependency::{DependencyGraphResolver, ResolutionReport};
use crate::engine::{ReleaseEngine, Revision};
use crate::error::{RepoError, Result};
use crate::index::resolve_entries;
use crate::source::IndexCache;

/// What to release
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRequest {
    pub release: String,
    pub namespace: String,
    pub registry: String,
    pub package: String,
    pub constraint: String,
    /// Root values references, in merge order
    pub value_refs: Vec<String>,
    /// Applied last
    pub overrides: Values,
    /// Record the release on the references it composes
    pub record_refs: bool,
}

impl ReleaseRequest {
    pub fn new(
        release: impl Into<String>,
        registry: impl Into<String>,
        package: impl Into<String>,
        constraint: impl Into<String>,
    ) -> Self {
        Self {
            release: release.into(),
            namespace: "default".to_string(),
            registry: registry.into(),
            package: package.into(),
            constraint: constraint.into(),
            value_refs: Vec::new(),
            overrides: Values::new(),
            record_refs: true,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_ref(mut self, name: impl Into<String>) -> Self {
        self.value_refs.push(name.into());
        self
    }

    pub fn with_overrides(mut self, overrides: Values) -> Self {
        self.overrides = overrides;
        self
    }

    /// Compose references without annotating them, for inspection
    pub fn without_recording(mut self) -> Self {
        self.record_refs = false;
        self
    }
}

/// A release ready for the engine
#[derive(Debug, Clone)]
pub struct PreparedRelease {
    pub release: String,
    pub namespace: String,
    /// The resolved package with its dependencies attached
    pub package: PackageVersion,
    /// Package defaults overlaid with composed references and overrides
    pub values: Values,
    pub composed: ComposedValues,
    pub report: ResolutionReport,
}

/// Prepares and deploys releases
#[derive(Clone)]
pub struct ReleasePlanner {
    resolver: DependencyGraphResolver,
    composer: ValuesComposer,
}

impl ReleasePlanner {
    pub fn new(resolver: DependencyGraphResolver, composer: ValuesComposer) -> Self {
        Self { resolver, composer }
    }

    pub fn resolver(&self) -> &DependencyGraphResolver {
        &self.resolver
    }

    pub async fn plan(&self, request: &ReleaseRequest) -> Result<PreparedRelease> {
        let registry = self.resolver.catalog().require(&request.registry)?;
        let source = self.resolver.source();
        let mut cache = IndexCache::new();

        let entries = source.entries(registry, &request.package, &mut cache).await?;
        let entry = resolve_entries(&entries, &request.constraint)?.ok_or_else(|| {
            RepoError::VersionNotFound {
                name: request.package.clone(),
                constraint: request.constraint.clone(),
                registry: registry.name.clone(),
            }
        })?;
        let mut package = source.load(registry, entry).await?;
        tracing::info!(release = %request.release, package = %package.key(), "resolved package version");

        let composed = if request.record_refs {
            self.composer
                .compose(&request.release, &request.value_refs)
                .await?
        } else {
            self.composer.preview(&request.value_refs).await?
        };
        let mut values = package.default_values.clone();
        values.merge(&composed.values);
        values.merge(&request.overrides);

        let report = self
            .resolver
            .resolve_with_cache(&mut package, registry, &values, &mut cache)
            .await?;

        Ok(PreparedRelease {
            release: request.release.clone(),
            namespace: request.namespace.clone(),
            package,
            values,
            composed,
            report,
        })
    }

    /// Install the release, or upgrade it if the engine already has it
    pub async fn deploy(&self, prepared: &PreparedRelease, engine: &dyn ReleaseEngine) -> Result<Revision> {
        let installed = engine
            .get_installed(&prepared.release, &prepared.namespace)
            .await?;

        let revision = match installed {
            Some(current) => {
                tracing::info!(release = %prepared.release, from = %current.version, to = %prepared.package.version(), "upgrading release");
                engine
                    .upgrade(&prepared.release, &prepared.namespace, &prepared.package, &prepared.values)
                    .await?
            }
            None => {
                tracing::info!(release = %prepared.release, package = %prepared.package.key(), "installing release");
                engine
                    .install(&prepared.release, &prepared.namespace, &prepared.package, &prepared.values)
                    .await?
            }
        };
        Ok(revision)
    }

    pub async fn plan_and_deploy(
        &self,
        request: &ReleaseRequest,
        engine: &dyn ReleaseEngine,
    ) -> Result<(PreparedRelease, Revision)> {
        let prepared = self.plan(request).await?;
        let revision = self.deploy(&prepared, engine).await?;
        Ok((prepared, revision))
    }
}
