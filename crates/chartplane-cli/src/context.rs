//! Components shared by commands that talk to the cluster

use chartplane_core::EngineConfig;
use chartplane_kube::{ChartContentStore, ConfigMapStore, ObjectStore, ValuesComposer};
use chartplane_repo::{
    DependencyGraphResolver, HttpFetcher, PackageSource, RegistryCatalog, ReleasePlanner,
};
use std::path::Path;
use std::sync::Arc;

use crate::error::{CliError, Result};

/// Configuration and cluster-backed components for one invocation
pub struct Context {
    pub config: EngineConfig,
    pub catalog: RegistryCatalog,
    store: Arc<dyn ObjectStore>,
}

impl Context {
    /// Load configuration; `namespace` overrides the configured one
    pub fn load_config(config_path: Option<&Path>, namespace: Option<&str>) -> Result<EngineConfig> {
        let mut config = match config_path {
            Some(path) => EngineConfig::load_from(path)?,
            None => EngineConfig::load()?,
        };
        if let Some(namespace) = namespace {
            config.namespace = namespace.to_string();
        }
        Ok(config)
    }

    pub async fn connect(config_path: Option<&Path>, namespace: Option<&str>) -> Result<Self> {
        let config = Self::load_config(config_path, namespace)?;
        let catalog = RegistryCatalog::load()?;
        let store = ConfigMapStore::new().await.map_err(|e| CliError::Cluster {
            message: format!("could not connect to the cluster: {e}"),
        })?;
        tracing::debug!(namespace = %config.namespace, registries = catalog.registries.len(), "connected");

        Ok(Self {
            config,
            catalog,
            store: Arc::new(store),
        })
    }

    pub fn source(&self) -> Result<PackageSource> {
        let content = ChartContentStore::new(self.store.clone(), &self.config.namespace);
        let fetcher = HttpFetcher::new(self.config.fetch.timeout)?;
        Ok(PackageSource::new(content).with_fetcher(Arc::new(fetcher)))
    }

    pub fn composer(&self) -> ValuesComposer {
        ValuesComposer::new(
            self.store.clone(),
            &self.config.namespace,
            self.config.values.clone(),
        )
    }

    pub fn planner(&self) -> Result<ReleasePlanner> {
        let resolver = DependencyGraphResolver::new(self.source()?, self.catalog.clone());
        Ok(ReleasePlanner::new(resolver, self.composer()))
    }
}
