//! In-memory object store for testing
//!
//! Stores objects in a map and publishes changes on a broadcast channel so
//! watches behave like the real thing, without requiring a cluster.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

use super::{LabelSelector, ObjectKey, ObjectKind, ObjectStore, StoredObject, WatchEvent};
use crate::error::{KubeError, Result};

const EVENT_CAPACITY: usize = 256;

/// In-memory object store
#[derive(Clone)]
pub struct MockObjectStore {
    objects: Arc<RwLock<BTreeMap<ObjectKey, StoredObject>>>,
    operations: Arc<RwLock<OperationCounts>>,
    events: broadcast::Sender<WatchEvent>,
    revision: Arc<AtomicU64>,
}

/// Counts of operations performed, for assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub watches: usize,
}

impl MockObjectStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            operations: Arc::new(RwLock::new(OperationCounts::default())),
            events,
            revision: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn operation_counts(&self) -> OperationCounts {
        self.operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_counts(&self) {
        *self.operations.write().unwrap_or_else(PoisonError::into_inner) = OperationCounts::default();
    }

    /// All stored objects of a kind, in key order
    pub fn objects(&self, kind: ObjectKind) -> Vec<StoredObject> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|o| o.kind == kind)
            .cloned()
            .collect()
    }

    /// Remove an object, publishing a deletion
    pub fn remove(&self, key: &ObjectKey) -> Option<StoredObject> {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Some(object) = &removed {
            self.publish(WatchEvent::Deleted(object.clone()));
        }
        removed
    }

    /// Overwrite raw data in place without touching the resource version
    pub fn corrupt(&self, key: &ObjectKey, field: &str, data: &[u8]) {
        if let Some(object) = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(key)
        {
            object.data.insert(field.to_string(), data.to_vec());
        }
    }

    fn count(&self, apply: impl FnOnce(&mut OperationCounts)) {
        apply(&mut self.operations.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event: WatchEvent) {
        // No receivers is not an error
        let _ = self.events.send(event);
    }
}

impl Default for MockObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<StoredObject> {
        self.count(|ops| ops.gets += 1);

        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| key.not_found())
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<StoredObject>> {
        self.count(|ops| ops.lists += 1);

        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|o| o.kind == kind && o.namespace == namespace && selector.matches(&o.labels))
            .cloned()
            .collect())
    }

    async fn create(&self, object: &StoredObject) -> Result<StoredObject> {
        self.count(|ops| ops.creates += 1);

        let created = {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            let key = object.key();
            if objects.contains_key(&key) {
                return Err(KubeError::ObjectAlreadyExists {
                    kind: key.kind.to_string(),
                    namespace: key.namespace,
                    name: key.name,
                });
            }

            let mut created = object.clone();
            let revision = self.next_revision();
            created.uid = Some(format!("uid-{revision}"));
            created.resource_version = Some(revision);
            objects.insert(key, created.clone());
            created
        };

        self.publish(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, object: &StoredObject) -> Result<StoredObject> {
        self.count(|ops| ops.updates += 1);

        let updated = {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            let key = object.key();
            let existing = objects.get(&key).ok_or_else(|| key.not_found())?;

            if let (Some(expected), Some(actual)) =
                (&object.resource_version, &existing.resource_version)
            {
                if expected != actual {
                    return Err(KubeError::Conflict {
                        kind: key.kind.to_string(),
                        name: key.name,
                        expected: expected.clone(),
                        actual: actual.clone(),
                    });
                }
            }

            let mut updated = object.clone();
            updated.uid = existing.uid.clone();
            updated.resource_version = Some(self.next_revision());
            objects.insert(key, updated.clone());
            updated
        };

        self.publish(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.count(|ops| ops.deletes += 1);
        self.remove(key);
        Ok(())
    }

    async fn watch(
        &self,
        key: &ObjectKey,
        _since: Option<&str>,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        self.count(|ops| ops.watches += 1);

        let receiver = self.events.subscribe();
        let key = key.clone();

        Ok(stream::unfold(receiver, move |mut receiver| {
            let key = key.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if event.object().key() == key => {
                            return Some((Ok(event), receiver));
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed())
    }
}
