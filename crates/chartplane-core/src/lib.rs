//! chartplane core - types shared by the chart distribution engine
//!
//! - `PackageVersion`: a loaded package (metadata, templates, schema definitions, default values)
//! - `Dependency`: a declared dependency and its inclusion condition
//! - `Values`: configuration trees with deep merge
//! - `VersionResolver`: constraint matching against an index
//! - `ArchiveLoader`: archive bytes to packages
//! - `EngineConfig`: engine settings

pub mod archive;
pub mod config;
pub mod error;
pub mod package;
pub mod values;
pub mod version;

pub use archive::{ArchiveLoader, TarballLoader};
pub use config::{ConvergencePolicy, EngineConfig, OverflowPolicy};
pub use error::{CoreError, Result};
pub use package::{ConditionOutcome, Dependency, PackageFile, PackageMetadata, PackageVersion};
pub use values::Values;
pub use version::{UNRESOLVED, VersionConstraint, VersionResolver, is_unresolved, parse_version};
