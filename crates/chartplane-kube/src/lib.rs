//! chartplane kube - Kubernetes-backed state for the chart engine
//!
//! This crate provides:
//! - **Object store**: labeled byte-map objects in ConfigMaps, or in memory for tests
//! - **Chart content**: package content split into per-bucket artifacts with digests
//! - **Values composition**: reference trees merged into one configuration
//! - **Sub-resource sync**: wait for dependent package resources to converge

pub mod content;
pub mod error;
pub mod store;
pub mod sync;
pub mod values;

pub use content::{ArtifactKey, Bucket, ChartContent, ChartContentStore, WriteSummary};
pub use error::{KubeError, Result};
pub use store::{
    ConfigMapStore, LabelSelector, MockObjectStore, ObjectKey, ObjectKind, ObjectStore,
    OperationCounts, OwnerRef, StoredObject, WatchEvent,
};
pub use sync::{SubResourceHandle, SubResourceSyncWatcher, SyncOutcome, SyncState};
pub use values::{
    ComposedValues, OverflowKind, ReferenceOverflow, ValuesComposer, ValuesRef,
};
