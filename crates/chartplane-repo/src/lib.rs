//! chartplane repo - registries, package sources and dependency resolution
//!
//! This crate provides:
//!
//! - **Registry catalog**: named registries with optional groups and basic auth
//! - **Index model**: Helm-compatible `index.yaml` with version resolution
//! - **Package source**: the content store first, registry download second
//! - **Dependency resolution**: condition-gated, recursive, cycle-checked
//! - **Release planning**: resolved package and composed values for an engine
//!
//! ## Example
//!
//! ```rust,no_run
//! use chartplane_kube::{ChartContentStore, MockObjectStore};
//! use chartplane_repo::{DependencyGraphResolver, PackageSource, RegistryCatalog};
//! use chartplane_core::Values;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = RegistryCatalog::load()?;
//! let content = ChartContentStore::new(Arc::new(MockObjectStore::new()), "default");
//! let resolver = DependencyGraphResolver::new(PackageSource::new(content), catalog.clone());
//!
//! let registry = catalog.require("stable")?;
//! let mut cache = chartplane_repo::IndexCache::new();
//! let entries = resolver.source().entries(registry, "web", &mut cache).await?;
//! if let Some(entry) = chartplane_repo::resolve_entries(&entries, "^1")? {
//!     let mut package = resolver.source().load(registry, entry).await?;
//!     let report = resolver.resolve(&mut package, registry, &Values::new()).await?;
//!     println!("{}", report.render_tree());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod http;
pub mod index;
pub mod release;
pub mod source;

// Re-exports for convenience
pub use config::{Credentials, Registry, RegistryAuth, RegistryCatalog, RegistryMatch};
pub use dependency::{
    DependencyGraphResolver, DependencyNode, DependencyStatus, DependencySync,
    PackageResourceSpec, ResolutionReport,
};
pub use engine::{MockReleaseEngine, ReleaseEngine, Revision, RevisionStatus};
pub use error::{RepoError, Result};
pub use http::{ArchiveFetcher, HttpFetcher, compute_digest, resolve_reference_url};
pub use index::{IndexDependency, PackEntry, RepositoryIndex, resolve_entries};
pub use release::{PreparedRelease, ReleasePlanner, ReleaseRequest};
pub use source::{IndexCache, PackageSource};
