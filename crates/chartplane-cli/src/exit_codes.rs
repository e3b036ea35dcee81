//! Standard exit codes for CLI operations
//!
//! These exit codes follow Unix conventions and sysexits.h where applicable.

/// General error - unspecified failure
pub const ERROR: i32 = 1;

/// Input error - invalid constraint, version or archive
pub const INPUT_ERROR: i32 = 2;

/// Not found - package, version, registry or values reference missing
pub const NOT_FOUND: i32 = 3;

/// Resolution error - a dependency or values reference could not be resolved
pub const RESOLUTION_ERROR: i32 = 4;

/// IO error - file not found, permission denied, etc.
pub const IO_ERROR: i32 = 5;

/// Cluster error - the object store could not be reached or rejected a request
pub const CLUSTER_ERROR: i32 = 6;

/// Configuration error (following sysexits.h EX_CONFIG)
pub const CONFIG_ERROR: i32 = 78;
