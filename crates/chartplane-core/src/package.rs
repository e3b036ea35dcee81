//! Package model: metadata, declared dependencies and loaded content

use semver::Version;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CoreError;
use crate::values::Values;
use crate::version::parse_version;

/// Package metadata (`Chart.yaml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    pub name: String,

    #[serde(deserialize_with = "deserialize_version")]
    pub version: Version,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

impl PackageMetadata {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            api_version: Some("v2".to_string()),
            name: name.into(),
            version,
            description: None,
            app_version: None,
            dependencies: Vec::new(),
        }
    }

    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        let metadata: Self = serde_yaml::from_str(yaml)?;
        if metadata.name.trim().is_empty() {
            return Err(CoreError::InvalidPackage {
                message: "package name is empty".to_string(),
            });
        }
        Ok(metadata)
    }
}

fn deserialize_version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Version, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_version(&raw).map_err(serde::de::Error::custom)
}

/// A declared dependency of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,

    /// Version constraint
    #[serde(default)]
    pub version: String,

    /// Registry URL the dependency is published in
    #[serde(default)]
    pub repository: String,

    /// Dot path into the parent's values controlling inclusion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Result of evaluating a dependency condition against parent values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionOutcome {
    /// No condition, the condition path is absent, or it holds `true`
    Included,
    /// The condition holds a boolean `false`
    Excluded,
    /// The condition holds a value that does not parse as a boolean; treated as false
    Unparsable { value: String },
    /// The condition path has an unsupported shape; the dependency is skipped
    Invalid { segments: usize },
}

impl ConditionOutcome {
    pub fn is_included(&self) -> bool {
        matches!(self, Self::Included)
    }

    /// The error to record for outcomes that need reporting
    pub fn to_error(&self, dependency: &Dependency) -> Option<CoreError> {
        let condition = dependency.condition.clone().unwrap_or_default();
        let message = match self {
            Self::Included | Self::Excluded => return None,
            Self::Unparsable { value } => format!("'{value}' is not a boolean"),
            Self::Invalid { segments } => {
                format!("expected one or two path segments, found {segments}")
            }
        };
        Some(CoreError::ConditionParseFailed {
            dependency: dependency.name.clone(),
            condition,
            message,
        })
    }
}

impl Dependency {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            repository: repository.into(),
            condition: None,
            alias: None,
            tags: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Name the dependency is known by in the parent (alias or name)
    pub fn effective_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Evaluate the inclusion condition against the parent's composed values.
    ///
    /// `a` reads the value at key `a`. `a.b` reads key `b` of the map at `a`;
    /// if `a` is not a map or `b` is absent the dependency stays included.
    /// Values parse as booleans the way `strconv`-style parsers do
    /// (`1`, `t`, `true`, `0`, `f`, `false` and their capitalized forms).
    pub fn evaluate_condition(&self, values: &Values) -> ConditionOutcome {
        let Some(condition) = self.condition.as_deref().map(str::trim) else {
            return ConditionOutcome::Included;
        };
        if condition.is_empty() {
            return ConditionOutcome::Included;
        }

        let segments: Vec<&str> = condition.split('.').collect();
        let found = match segments.as_slice() {
            [key] => values.inner().get(*key),
            [outer, inner] => values
                .inner()
                .get(*outer)
                .and_then(JsonValue::as_object)
                .and_then(|map| map.get(*inner)),
            _ => {
                return ConditionOutcome::Invalid {
                    segments: segments.len(),
                };
            }
        };

        match found {
            None | Some(JsonValue::Null) | Some(JsonValue::Object(_)) => ConditionOutcome::Included,
            Some(value) => {
                let rendered = render_scalar(value);
                match parse_bool(&rendered) {
                    Some(true) => ConditionOutcome::Included,
                    Some(false) => ConditionOutcome::Excluded,
                    None => ConditionOutcome::Unparsable { value: rendered },
                }
            }
        }
    }
}

fn render_scalar(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// One file of a package, named by its path relative to its bucket root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFile {
    pub name: String,
    pub data: Vec<u8>,
}

impl PackageFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// A loaded package version.
///
/// Built fresh for every resolution; sub-packages attached during dependency
/// resolution carry their merged values in `default_values`.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageVersion {
    pub metadata: PackageMetadata,

    /// Name of the registry the package was loaded from
    pub registry: String,

    /// Files under `templates/`
    pub templates: Vec<PackageFile>,

    /// Schema and definition files (`crds/`)
    pub schema_defs: Vec<PackageFile>,

    pub default_values: Values,

    pub download_url: Option<String>,

    /// Resolved sub-packages, in declaration order
    pub attached: Vec<PackageVersion>,
}

impl PackageVersion {
    pub fn new(metadata: PackageMetadata, registry: impl Into<String>) -> Self {
        Self {
            metadata,
            registry: registry.into(),
            templates: Vec::new(),
            schema_defs: Vec::new(),
            default_values: Values::new(),
            download_url: None,
            attached: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &Version {
        &self.metadata.version
    }

    /// `name-version`
    pub fn key(&self) -> String {
        format!("{}-{}", self.metadata.name, self.metadata.version)
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.metadata.dependencies
    }

    pub fn attached(&self, name: &str) -> Option<&PackageVersion> {
        self.attached.iter().find(|p| p.name() == name)
    }
}
