//! Engine configuration
//!
//! Read from `$CHARTPLANE_CONFIG` or `~/.config/chartplane/config.yaml`:
//!
//! ```yaml
//! namespace: charts
//! values:
//!   maxDepth: 10
//!   overflow: report
//! sync:
//!   timeout: 10s
//!   convergence: any-modification
//! fetch:
//!   timeout: 30s
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Environment variable overriding the configuration file location
pub const CONFIG_ENV: &str = "CHARTPLANE_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Namespace holding artifacts, values references and package resources
    pub namespace: String,
    pub values: ValuesConfig,
    pub sync: SyncConfig,
    pub fetch: FetchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            values: ValuesConfig::default(),
            sync: SyncConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

/// What to do with a values reference that is cyclic or nested too deep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Drop the branch and report it alongside the composed values
    #[default]
    Report,
    /// Fail the composition
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValuesConfig {
    /// Deepest reference level still composed; roots are level 1
    pub max_depth: usize,
    pub overflow: OverflowPolicy,
}

impl Default for ValuesConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            overflow: OverflowPolicy::Report,
        }
    }
}

/// When a dependent package resource counts as converged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConvergencePolicy {
    /// Any modification observed on the resource
    #[default]
    AnyModification,
    /// A modification whose status reports dependencies and versions as synced
    StatusSynced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub convergence: ConvergencePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            convergence: ConvergencePolicy::AnyModification,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!(path = %path.display(), "no engine configuration, using defaults");
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// `$CHARTPLANE_CONFIG`, else `<config dir>/chartplane/config.yaml`
    pub fn default_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let config_dir = dirs::config_dir().ok_or_else(|| CoreError::InvalidConfig {
            message: "Could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join("chartplane").join("config.yaml"))
    }

    fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(CoreError::InvalidConfig {
                message: "namespace must not be empty".to_string(),
            });
        }
        if self.sync.timeout.is_zero() {
            return Err(CoreError::InvalidConfig {
                message: "sync.timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.values.max_depth, 10);
        assert_eq!(config.values.overflow, OverflowPolicy::Report);
        assert_eq!(config.sync.timeout, Duration::from_secs(10));
        assert_eq!(config.sync.convergence, ConvergencePolicy::AnyModification);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "namespace: charts\nsync:\n  timeout: 1m 30s\n  convergence: status-synced\nvalues:\n  overflow: fail\n",
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.namespace, "charts");
        assert_eq!(config.sync.timeout, Duration::from_secs(90));
        assert_eq!(config.sync.convergence, ConvergencePolicy::StatusSynced);
        assert_eq!(config.values.overflow, OverflowPolicy::Fail);
        assert_eq!(config.values.max_depth, 10);
        assert_eq!(config.fetch.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = EngineConfig::default();
        config.values.max_depth = 4;
        config.save_to(&path).unwrap();

        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "sync:\n  timeout: 0s\n").unwrap();
        assert!(matches!(
            EngineConfig::load_from(&path),
            Err(CoreError::InvalidConfig { .. })
        ));
    }
}
