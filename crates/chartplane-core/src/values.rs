//! Configuration trees with deep merge support

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::path::Path;

use crate::error::{CoreError, Result};

/// A configuration tree (default values, overrides or composed release values)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    /// Empty map
    pub fn new() -> Self {
        Self(JsonValue::Object(Map::new()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse from YAML; an empty document yields an empty map
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::new());
        }
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Ok(Self::from_value(value))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Ok(Self::from_value(value))
    }

    /// Wrap a JSON value, mapping `null` to an empty map
    pub fn from_value(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::new(),
            other => Self(other),
        }
    }

    /// Deep merge `overlay` into these values.
    ///
    /// Where both sides hold a map the merge recurses; otherwise the overlay
    /// value replaces the existing one (arrays included).
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Deep merge `overlay` under a dotted key path, creating intermediate maps.
    ///
    /// An empty path merges at the root.
    pub fn merge_at(&mut self, path: &str, overlay: &Values) -> Result<()> {
        let segments = split_path(path)?;
        let target = ensure_path(&mut self.0, &segments)?;
        deep_merge(target, &overlay.0);
        Ok(())
    }

    /// Set a value by dotted path (e.g., "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) -> Result<()> {
        let segments = split_path(path)?;
        *ensure_path(&mut self.0, &segments)? = value;
        Ok(())
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        path.split('.')
            .filter(|s| !s.is_empty())
            .try_fold(&self.0, |current, key| current.as_object()?.get(key))
    }

    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// Values a dependency sees from its parent.
    ///
    /// The map found under the dependency's key becomes the root, and
    /// `global` is carried over unchanged.
    pub fn scope_for_dependency(&self, key: &str) -> Values {
        let mut scoped = Map::new();

        if let JsonValue::Object(parent) = &self.0 {
            if let Some(global) = parent.get("global") {
                scoped.insert("global".to_string(), global.clone());
            }
            if let Some(JsonValue::Object(own)) = parent.get(key) {
                scoped.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        Values(JsonValue::Object(scoped))
    }

    /// Dependency defaults overridden by the parent's scoped values
    pub fn for_dependency(defaults: Values, parent: &Values, key: &str) -> Values {
        let mut result = defaults;
        result.merge(&parent.scope_for_dependency(key));
        result
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.0)?)
    }
}

impl From<JsonValue> for Values {
    fn from(value: JsonValue) -> Self {
        Self::from_value(value)
    }
}

/// Recursive merge: maps merge key by key, anything else is overwritten
pub fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(CoreError::ValuesMerge {
            message: format!("invalid key path '{path}'"),
        });
    }
    Ok(segments)
}

/// Walk to `segments`, replacing non-map intermediates with empty maps
fn ensure_path<'a>(mut current: &'a mut JsonValue, segments: &[&str]) -> Result<&'a mut JsonValue> {
    for key in segments {
        if !current.is_object() {
            *current = JsonValue::Object(Map::new());
        }
        let JsonValue::Object(map) = current else {
            return Err(CoreError::ValuesMerge {
                message: format!("cannot descend into '{key}'"),
            });
        };
        current = map
            .entry((*key).to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_maps_recurse() {
        let mut base = Values(json!({"image": {"repo": "nginx", "tag": "1.0"}, "replicas": 1}));
        base.merge(&Values(json!({"image": {"tag": "2.0"}, "replicas": 3})));
        assert_eq!(
            base.0,
            json!({"image": {"repo": "nginx", "tag": "2.0"}, "replicas": 3})
        );
    }

    #[test]
    fn test_deep_merge_overwrites_non_maps() {
        let mut base = Values(json!({"ports": [80, 443], "service": {"type": "ClusterIP"}}));
        base.merge(&Values(json!({"ports": [8080], "service": "none"})));
        assert_eq!(base.0, json!({"ports": [8080], "service": "none"}));
    }

    #[test]
    fn test_merge_at_nested_path() {
        let mut values = Values(json!({"a": {"keep": true}}));
        values
            .merge_at("a.b", &Values(json!({"foo": "bar"})))
            .unwrap();
        assert_eq!(values.0, json!({"a": {"keep": true, "b": {"foo": "bar"}}}));

        values.merge_at("", &Values(json!({"top": 1}))).unwrap();
        assert_eq!(values.get("top"), Some(&json!(1)));
        assert!(values.merge_at("a..b", &Values::new()).is_err());
    }

    #[test]
    fn test_merge_at_replaces_scalar_intermediate() {
        let mut values = Values(json!({"a": 5}));
        values.merge_at("a.b", &Values(json!({"c": 1}))).unwrap();
        assert_eq!(values.0, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_get_and_set() {
        let mut values = Values::new();
        values.set("image.tag", json!("v1")).unwrap();
        assert_eq!(values.get("image.tag"), Some(&json!("v1")));
        assert_eq!(values.get("image.missing"), None);
        assert_eq!(values.get("image.tag.deeper"), None);
    }

    #[test]
    fn test_for_dependency_scoping() {
        let parent = Values(json!({
            "global": {"registry": "docker.io"},
            "redis": {"replicas": 3},
            "postgresql": {"enabled": false}
        }));
        let defaults = Values(json!({"replicas": 1, "port": 6379}));

        let scoped = Values::for_dependency(defaults, &parent, "redis");
        assert_eq!(
            scoped.0,
            json!({"global": {"registry": "docker.io"}, "replicas": 3, "port": 6379})
        );
    }

    #[test]
    fn test_null_and_empty_yaml_are_empty() {
        assert!(Values::from_yaml("").unwrap().is_empty());
        assert!(Values::from_yaml("~").unwrap().is_empty());
        assert!(Values::from_value(JsonValue::Null).0.is_object());
    }
}
