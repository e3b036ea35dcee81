//! Package archive loading
//!
//! Archives are gzip tarballs in chart layout, with every entry under a single
//! top-level directory:
//!
//! ```text
//! web/Chart.yaml
//! web/values.yaml
//! web/templates/deployment.yaml
//! web/templates/redis/statefulset.yaml
//! web/crds/widget.yaml
//! ```

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tar::{Archive, Builder, Header};
use walkdir::WalkDir;

use crate::error::{CoreError, Result};
use crate::package::{PackageFile, PackageMetadata, PackageVersion};
use crate::values::Values;

const METADATA_FILE: &str = "Chart.yaml";
const VALUES_FILE: &str = "values.yaml";
const TEMPLATES_DIR: &str = "templates/";
const SCHEMA_DEFS_DIR: &str = "crds/";

/// Turns archive bytes into a package
pub trait ArchiveLoader: Send + Sync {
    /// Parse an archive. The returned package has no registry set.
    fn load(&self, bytes: &[u8]) -> Result<PackageVersion>;
}

/// Loader for gzip tarballs in chart layout
#[derive(Debug, Clone, Copy, Default)]
pub struct TarballLoader;

impl ArchiveLoader for TarballLoader {
    fn load(&self, bytes: &[u8]) -> Result<PackageVersion> {
        let mut archive = Archive::new(GzDecoder::new(bytes));
        let mut files = BTreeMap::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let path = entry.path()?.to_string_lossy().replace('\\', "/");
            // Drop the top-level package directory
            let Some((_, relative)) = path.split_once('/') else {
                continue;
            };

            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            files.insert(relative.to_string(), data);
        }

        assemble(files)
    }
}

/// Load an unpacked package directory
pub fn load_dir(root: &Path) -> Result<PackageVersion> {
    if !root.join(METADATA_FILE).is_file() {
        return Err(CoreError::MissingArchiveEntry {
            path: root.join(METADATA_FILE).display().to_string(),
        });
    }

    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| CoreError::InvalidPackage {
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| CoreError::InvalidPackage {
                message: e.to_string(),
            })?
            .to_string_lossy()
            .replace('\\', "/");
        files.insert(relative, std::fs::read(entry.path())?);
    }

    assemble(files)
}

/// Build a tarball for a package, the inverse of [`TarballLoader`]
pub fn pack(package: &PackageVersion) -> Result<Vec<u8>> {
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let root = package.name();

    append(
        &mut builder,
        &format!("{root}/{METADATA_FILE}"),
        serde_yaml::to_string(&package.metadata)?.as_bytes(),
    )?;
    append(
        &mut builder,
        &format!("{root}/{VALUES_FILE}"),
        package.default_values.to_yaml()?.as_bytes(),
    )?;
    for file in &package.templates {
        append(&mut builder, &format!("{root}/{TEMPLATES_DIR}{}", file.name), &file.data)?;
    }
    for file in &package.schema_defs {
        append(&mut builder, &format!("{root}/{SCHEMA_DEFS_DIR}{}", file.name), &file.data)?;
    }

    Ok(builder.into_inner()?.finish()?)
}

fn append<W: std::io::Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

/// Sort relative paths into metadata, values, templates and schema definitions
fn assemble(mut files: BTreeMap<String, Vec<u8>>) -> Result<PackageVersion> {
    let metadata = files
        .remove(METADATA_FILE)
        .ok_or_else(|| CoreError::MissingArchiveEntry {
            path: METADATA_FILE.to_string(),
        })?;
    let metadata = PackageMetadata::from_yaml(&utf8(METADATA_FILE, metadata)?)?;

    let mut package = PackageVersion::new(metadata, "");
    if let Some(values) = files.remove(VALUES_FILE) {
        package.default_values = Values::from_yaml(&utf8(VALUES_FILE, values)?)?;
    }

    for (path, data) in files {
        if let Some(name) = path.strip_prefix(TEMPLATES_DIR) {
            package.templates.push(PackageFile::new(name, data));
        } else if let Some(name) = path.strip_prefix(SCHEMA_DEFS_DIR) {
            package.schema_defs.push(PackageFile::new(name, data));
        } else {
            tracing::debug!(package = %package.name(), path = %path, "ignoring file outside known directories");
        }
    }

    Ok(package)
}

fn utf8(path: &str, data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|e| CoreError::InvalidPackage {
        message: format!("{path} is not valid UTF-8: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use serde_json::json;

    fn sample() -> PackageVersion {
        let mut package = PackageVersion::new(PackageMetadata::new("web", Version::new(1, 2, 0)), "");
        package.default_values = Values(json!({"replicas": 2}));
        package.templates = vec![
            PackageFile::new("deployment.yaml", "kind: Deployment"),
            PackageFile::new("redis/statefulset.yaml", "kind: StatefulSet"),
        ];
        package.schema_defs = vec![PackageFile::new("widget.yaml", "kind: CustomResourceDefinition")];
        package
    }

    #[test]
    fn test_tarball_loads_chart_layout() {
        let bytes = pack(&sample()).unwrap();
        let loaded = TarballLoader.load(&bytes).unwrap();

        assert_eq!(loaded.name(), "web");
        assert_eq!(loaded.version(), &Version::new(1, 2, 0));
        assert_eq!(loaded.default_values.0, json!({"replicas": 2}));
        assert_eq!(loaded.templates, sample().templates);
        assert_eq!(loaded.schema_defs, sample().schema_defs);
    }

    #[test]
    fn test_tarball_without_metadata_fails() {
        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        append(&mut builder, "web/values.yaml", b"a: 1").unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let err = TarballLoader.load(&bytes).unwrap_err();
        assert!(matches!(err, CoreError::MissingArchiveEntry { .. }));
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Chart.yaml"), "name: api\nversion: 0.3.1\n").unwrap();
        std::fs::create_dir_all(dir.path().join("templates/nested")).unwrap();
        std::fs::write(dir.path().join("templates/svc.yaml"), "kind: Service").unwrap();
        std::fs::write(dir.path().join("templates/nested/cm.yaml"), "kind: ConfigMap").unwrap();

        let package = load_dir(dir.path()).unwrap();
        assert_eq!(package.name(), "api");
        assert!(package.default_values.is_empty());
        let names: Vec<_> = package.templates.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["nested/cm.yaml", "svc.yaml"]);
    }
}
