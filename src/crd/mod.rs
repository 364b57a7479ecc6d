//! Custom Resource Definitions read by the monitor
//!
//! - VolumeSnapshot: namespaced snapshot request
//! - VolumeSnapshotContent: cluster-scoped record holding the backend handle

pub mod volume_snapshot;

pub use volume_snapshot::*;
