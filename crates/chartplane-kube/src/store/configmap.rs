//! Kubernetes ConfigMap object store
//!
//! Every object kind is stored as a ConfigMap carrying a `chartplane.io/kind`
//! label. ConfigMap names are prefixed with the kind (`values-ref-shared`), so
//! objects of different kinds never collide. Data fields go to `binaryData`,
//! so artifacts keep arbitrary bytes.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::{
    Api, DeleteParams, ListParams, PostParams, WatchEvent as KubeWatchEvent, WatchParams,
};
use kube::Client;

use super::{
    KIND_LABEL, LabelSelector, ObjectKey, ObjectKind, ObjectStore, OwnerRef, StoredObject,
    WatchEvent,
};
use crate::error::{KubeError, Result};

/// ConfigMap-backed object store
#[derive(Clone)]
pub struct ConfigMapStore {
    client: Client,
}

impl ConfigMapStore {
    /// Connect using the default kubeconfig or in-cluster configuration
    pub async fn new() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    /// Create with an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// ConfigMap name of an object
    fn config_map_name(kind: ObjectKind, name: &str) -> String {
        format!("{}-{}", kind.as_str(), name)
    }

    fn to_config_map(object: &StoredObject) -> ConfigMap {
        let mut labels = object.labels.clone();
        labels.insert(KIND_LABEL.to_string(), object.kind.as_str().to_string());

        let owner_references: Vec<OwnerReference> = object
            .owner_references
            .iter()
            .map(|owner| OwnerReference {
                api_version: owner.api_version.clone(),
                kind: owner.kind.clone(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
                block_owner_deletion: Some(true),
                controller: Some(false),
            })
            .collect();

        ConfigMap {
            metadata: ObjectMeta {
                name: Some(Self::config_map_name(object.kind, &object.name)),
                namespace: Some(object.namespace.clone()),
                labels: Some(labels),
                annotations: (!object.annotations.is_empty()).then(|| object.annotations.clone()),
                owner_references: (!owner_references.is_empty()).then_some(owner_references),
                resource_version: object.resource_version.clone(),
                ..Default::default()
            },
            binary_data: Some(
                object
                    .data
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn from_config_map(config_map: ConfigMap) -> Result<StoredObject> {
        let metadata = config_map.metadata;
        let raw_name = metadata.name.unwrap_or_default();

        let mut labels = metadata.labels.unwrap_or_default();
        let kind = labels
            .remove(KIND_LABEL)
            .as_deref()
            .and_then(ObjectKind::from_label)
            .ok_or_else(|| KubeError::InvalidObject {
                name: raw_name.clone(),
                message: format!("missing or unknown '{KIND_LABEL}' label"),
            })?;
        let name = raw_name
            .strip_prefix(kind.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .map(String::from)
            .unwrap_or(raw_name);

        let mut data: std::collections::BTreeMap<String, Vec<u8>> = config_map
            .binary_data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();
        // Objects edited by hand may carry plain data
        for (k, v) in config_map.data.unwrap_or_default() {
            data.entry(k).or_insert_with(|| v.into_bytes());
        }

        Ok(StoredObject {
            kind,
            namespace: metadata.namespace.unwrap_or_default(),
            name,
            labels,
            annotations: metadata.annotations.unwrap_or_default(),
            owner_references: metadata
                .owner_references
                .unwrap_or_default()
                .into_iter()
                .map(|r| OwnerRef {
                    api_version: r.api_version,
                    kind: r.kind,
                    name: r.name,
                    uid: r.uid,
                })
                .collect(),
            data,
            uid: metadata.uid,
            resource_version: metadata.resource_version,
        })
    }

    fn map_api_error(key: &ObjectKey, err: kube::Error) -> KubeError {
        match err {
            kube::Error::Api(ref response) if response.code == 404 => key.not_found(),
            kube::Error::Api(ref response) if response.code == 409 => {
                KubeError::ObjectAlreadyExists {
                    kind: key.kind.to_string(),
                    namespace: key.namespace.clone(),
                    name: key.name.clone(),
                }
            }
            other => KubeError::Api(other),
        }
    }
}

#[async_trait]
impl ObjectStore for ConfigMapStore {
    async fn get(&self, key: &ObjectKey) -> Result<StoredObject> {
        let config_map = self
            .api(&key.namespace)
            .get(&Self::config_map_name(key.kind, &key.name))
            .await
            .map_err(|e| Self::map_api_error(key, e))?;

        let object = Self::from_config_map(config_map)?;
        if object.kind != key.kind {
            return Err(key.not_found());
        }
        Ok(object)
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<StoredObject>> {
        let selector = selector.clone().label(KIND_LABEL, kind.as_str());
        let params = ListParams::default().labels(&selector.to_query());
        let list = self.api(namespace).list(&params).await?;

        list.items.into_iter().map(Self::from_config_map).collect()
    }

    async fn create(&self, object: &StoredObject) -> Result<StoredObject> {
        let mut config_map = Self::to_config_map(object);
        config_map.metadata.resource_version = None;

        let created = self
            .api(&object.namespace)
            .create(&PostParams::default(), &config_map)
            .await
            .map_err(|e| Self::map_api_error(&object.key(), e))?;
        Self::from_config_map(created)
    }

    async fn update(&self, object: &StoredObject) -> Result<StoredObject> {
        let key = object.key();
        let replaced = self
            .api(&object.namespace)
            .replace(
                &Self::config_map_name(object.kind, &object.name),
                &PostParams::default(),
                &Self::to_config_map(object),
            )
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref response) if response.code == 409 => KubeError::Conflict {
                    kind: key.kind.to_string(),
                    name: key.name.clone(),
                    expected: object.resource_version.clone().unwrap_or_default(),
                    actual: "newer".to_string(),
                },
                other => Self::map_api_error(&key, other),
            })?;
        Self::from_config_map(replaced)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        match self
            .api(&key.namespace)
            .delete(&Self::config_map_name(key.kind, &key.name), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            // Already deleted
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(Self::map_api_error(key, e)),
        }
    }

    async fn watch(
        &self,
        key: &ObjectKey,
        since: Option<&str>,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let params = WatchParams::default().fields(&format!(
            "metadata.name={}",
            Self::config_map_name(key.kind, &key.name)
        ));
        let stream = self
            .api(&key.namespace)
            .watch(&params, since.unwrap_or("0"))
            .await?;

        let name = key.name.clone();
        Ok(stream
            .filter_map(move |event| {
                let name = name.clone();
                async move {
                    match event {
                        Ok(KubeWatchEvent::Added(cm)) => {
                            Some(Self::from_config_map(cm).map(WatchEvent::Added))
                        }
                        Ok(KubeWatchEvent::Modified(cm)) => {
                            Some(Self::from_config_map(cm).map(WatchEvent::Modified))
                        }
                        Ok(KubeWatchEvent::Deleted(cm)) => {
                            Some(Self::from_config_map(cm).map(WatchEvent::Deleted))
                        }
                        Ok(KubeWatchEvent::Bookmark(_)) => None,
                        Ok(KubeWatchEvent::Error(response)) => Some(Err(KubeError::WatchClosed {
                            name,
                            reason: response.message,
                        })),
                        Err(e) => Some(Err(KubeError::Api(e))),
                    }
                }
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_map_round_trip() {
        let object = StoredObject::new(ObjectKind::Artifact, "charts", "chart-templates-web")
            .with_label("chartplane.io/package", "web")
            .with_data("deployment.yaml", b"kind: Deployment".to_vec())
            .with_owner(Some(&OwnerRef {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                name: "registry".to_string(),
                uid: "1234".to_string(),
            }));

        let config_map = ConfigMapStore::to_config_map(&object);
        let labels = config_map.metadata.labels.clone().unwrap();
        assert_eq!(labels.get(KIND_LABEL).map(String::as_str), Some("artifact"));

        let back = ConfigMapStore::from_config_map(config_map).unwrap();
        assert_eq!(back, object);
    }

    #[test]
    fn test_names_are_prefixed_by_kind() {
        let values_ref = StoredObject::new(ObjectKind::ValuesRef, "default", "web-redis");
        let package = StoredObject::new(ObjectKind::PackageResource, "default", "web-redis");

        let values_cm = ConfigMapStore::to_config_map(&values_ref);
        let package_cm = ConfigMapStore::to_config_map(&package);
        assert_eq!(values_cm.metadata.name.as_deref(), Some("values-ref-web-redis"));
        assert_eq!(package_cm.metadata.name.as_deref(), Some("package-web-redis"));

        let back = ConfigMapStore::from_config_map(values_cm).unwrap();
        assert_eq!(back.kind, ObjectKind::ValuesRef);
        assert_eq!(back.name, "web-redis");
        assert_eq!(back.key(), values_ref.key());
    }

    #[test]
    fn test_config_map_without_kind_is_invalid() {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some("stray".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            ConfigMapStore::from_config_map(config_map),
            Err(KubeError::InvalidObject { .. })
        ));
    }
}
