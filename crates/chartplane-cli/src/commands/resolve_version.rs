//! Resolve a version constraint against a local index file

use chartplane_core::{VersionResolver, is_unresolved};
use chartplane_repo::RepositoryIndex;
use console::style;
use std::path::Path;

use crate::error::{CliError, Result};

pub fn run(index_path: &Path, package: &str, constraint: &str) -> Result<()> {
    let bytes = std::fs::read(index_path)?;
    let index = RepositoryIndex::from_bytes(&bytes)?;
    let version = resolve(&index, package, constraint)?;
    println!("{version}");
    Ok(())
}

/// The greatest version of `package` in `index` satisfying `constraint`
pub fn resolve(index: &RepositoryIndex, package: &str, constraint: &str) -> Result<String> {
    let entries = index.get(package).ok_or_else(|| {
        CliError::not_found(
            format!("Package '{package}' is not in the index"),
            Some(format!("available: {}", index.names().join(", "))),
        )
    })?;

    let resolved = VersionResolver::resolve(constraint, entries.iter().map(|e| &e.version))?;
    if is_unresolved(&resolved) {
        let available: Vec<_> = entries.iter().map(|e| e.version.as_str()).collect();
        return Err(CliError::not_found(
            format!(
                "No version of {} satisfies '{}'",
                style(package).cyan(),
                constraint
            ),
            Some(format!("available: {}", available.join(", "))),
        ));
    }
    Ok(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit_codes;

    const INDEX: &str = r#"
apiVersion: v1
entries:
  redis:
    - name: redis
      version: 17.0.0
    - name: redis
      version: 17.3.1
    - name: redis
      version: 18.0.0-rc.1
"#;

    #[test]
    fn test_resolve_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.yaml");
        std::fs::write(&path, INDEX).unwrap();

        let index = RepositoryIndex::from_bytes(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(resolve(&index, "redis", "^17").unwrap(), "17.3.1");
        assert_eq!(resolve(&index, "redis", "17.0.0").unwrap(), "17.0.0");
    }

    #[test]
    fn test_resolve_errors() {
        let index = RepositoryIndex::from_yaml(INDEX).unwrap();

        let err = resolve(&index, "redis", ">=19").unwrap_err();
        assert_eq!(err.exit_code(), exit_codes::NOT_FOUND);

        let err = resolve(&index, "postgresql", "*").unwrap_err();
        assert_eq!(err.exit_code(), exit_codes::NOT_FOUND);

        let err = resolve(&index, "redis", ">>1").unwrap_err();
        assert_eq!(err.exit_code(), exit_codes::INPUT_ERROR);
    }
}
