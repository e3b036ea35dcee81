//! Convergence of dependent package resources
//!
//! After a dependent package resource is declared, another controller picks
//! it up and writes back to it. The watcher blocks until that write is seen
//! or the configured timeout elapses:
//!
//! ```text
//! Created/Updated -> Watching -> Converged
//!                             -> TimedOut
//! ```
//!
//! A timeout is terminal for the attempt; nothing is retried here.

use chartplane_core::config::SyncConfig;
use chartplane_core::ConvergencePolicy;
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{KubeError, Result};
use crate::store::{ObjectStore, StoredObject, WatchEvent};

/// Field holding the status written back by the controller
pub const STATUS_FIELD: &str = "status";

const SYNCED: &str = "synced";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Created,
    Updated,
    Watching,
    Converged,
    TimedOut,
}

/// A declared resource and where it is in its convergence
#[derive(Debug, Clone)]
pub struct SubResourceHandle {
    pub object: StoredObject,
    pub state: SyncState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The resource as last seen
    Converged(StoredObject),
    TimedOut { name: String, timeout: Duration },
}

impl SyncOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged(_))
    }

    /// Turn a timeout into an error
    pub fn ensure_converged(self) -> Result<StoredObject> {
        match self {
            Self::Converged(object) => Ok(object),
            Self::TimedOut { name, timeout } => Err(KubeError::ConvergenceTimeout {
                name,
                timeout: format!("{timeout:?}"),
            }),
        }
    }
}

/// Status reported by the controller owning package resources
#[derive(Debug, Default, Deserialize)]
struct ReportedStatus {
    #[serde(default)]
    dependencies: Option<String>,
    #[serde(default)]
    versions: Option<String>,
}

impl ReportedStatus {
    fn of(object: &StoredObject) -> Option<Self> {
        let raw = object.data.get(STATUS_FIELD)?;
        match serde_json::from_slice(raw) {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::debug!(resource = %object.name, error = %e, "ignoring unreadable status");
                None
            }
        }
    }

    fn is_synced(&self) -> bool {
        self.dependencies.as_deref() == Some(SYNCED) && self.versions.as_deref() == Some(SYNCED)
    }
}

/// Declares dependent package resources and waits for them to converge
#[derive(Clone)]
pub struct SubResourceSyncWatcher {
    store: Arc<dyn ObjectStore>,
    config: SyncConfig,
}

impl SubResourceSyncWatcher {
    pub fn new(store: Arc<dyn ObjectStore>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Create or update the resource
    pub async fn declare(&self, object: &StoredObject) -> Result<SubResourceHandle> {
        let (object, state) = match self.store.find(&object.key()).await? {
            Some(existing) => {
                let mut desired = object.clone();
                desired.uid = existing.uid;
                desired.resource_version = existing.resource_version;
                (self.store.update(&desired).await?, SyncState::Updated)
            }
            None => (self.store.create(object).await?, SyncState::Created),
        };
        tracing::debug!(resource = %object.name, state = ?state, "declared package resource");
        Ok(SubResourceHandle { object, state })
    }

    /// Wait for the controller to write back to the resource.
    ///
    /// The watch starts from the version the handle was declared at and is
    /// dropped on return.
    pub async fn wait(&self, handle: &mut SubResourceHandle) -> Result<SyncOutcome> {
        let key = handle.object.key();
        let mut events = self
            .store
            .watch(&key, handle.object.resource_version.as_deref())
            .await?;
        handle.state = SyncState::Watching;

        let converge = Self::converged(&mut events, self.config.convergence, &key.name);
        match tokio::time::timeout(self.config.timeout, converge).await {
            Ok(Ok(object)) => {
                handle.state = SyncState::Converged;
                tracing::debug!(resource = %object.name, "package resource converged");
                Ok(SyncOutcome::Converged(object))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                handle.state = SyncState::TimedOut;
                tracing::warn!(
                    resource = %key.name,
                    timeout = ?self.config.timeout,
                    "package resource did not converge"
                );
                Ok(SyncOutcome::TimedOut {
                    name: key.name.clone(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    pub async fn declare_and_wait(&self, object: &StoredObject) -> Result<SyncOutcome> {
        let mut handle = self.declare(object).await?;
        self.wait(&mut handle).await
    }

    /// First event that satisfies `policy`
    async fn converged(
        events: &mut BoxStream<'static, Result<WatchEvent>>,
        policy: ConvergencePolicy,
        name: &str,
    ) -> Result<StoredObject> {
        while let Some(event) = events.next().await {
            match event? {
                WatchEvent::Modified(object) => {
                    if Self::accepts(policy, &object) {
                        return Ok(object);
                    }
                    tracing::trace!(resource = %object.name, "modified but not yet synced");
                }
                WatchEvent::Added(_) => {}
                WatchEvent::Deleted(object) => {
                    return Err(KubeError::WatchClosed {
                        name: object.name,
                        reason: "resource was deleted".to_string(),
                    });
                }
            }
        }
        Err(KubeError::WatchClosed {
            name: name.to_string(),
            reason: "event stream ended".to_string(),
        })
    }

    fn accepts(policy: ConvergencePolicy, object: &StoredObject) -> bool {
        match policy {
            ConvergencePolicy::AnyModification => true,
            ConvergencePolicy::StatusSynced => {
                ReportedStatus::of(object).is_some_and(|status| status.is_synced())
            }
        }
    }
}
