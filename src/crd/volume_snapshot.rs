//! VolumeSnapshot CRDs
//!
//! Client-side definitions of the CSI external-snapshotter resources
//! (`snapshot.storage.k8s.io/v1`). They are only read, never installed, so
//! only the fields the monitor consumes are modelled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// VolumeSnapshot
// =============================================================================

/// A user's request for a point-in-time copy of a claim
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    status = "VolumeSnapshotStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    pub source: VolumeSnapshotSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Exactly one field is set by the API server
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_content_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_snapshot_content_name: Option<String>,

    /// RFC 3339 timestamp at which the backend cut the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Quantity string, e.g. `10Gi`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

// =============================================================================
// VolumeSnapshotContent
// =============================================================================

/// The cluster-scoped record of a snapshot taken by a CSI driver
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshotContent",
    plural = "volumesnapshotcontents",
    status = "VolumeSnapshotContentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotContentSpec {
    pub driver: String,

    /// `Delete` or `Retain`
    pub deletion_policy: String,

    #[serde(default)]
    pub source: VolumeSnapshotContentSource,

    pub volume_snapshot_ref: SnapshotObjectRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotContentSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_handle: Option<String>,

    /// Set for pre-provisioned snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_handle: Option<String>,
}

/// Back-reference from a content to its VolumeSnapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotObjectRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotContentStatus {
    /// Driver-specific identifier, e.g. `tank/k8s/pvc-1@snapshot-abc`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_handle: Option<String>,

    /// Nanoseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,
}

impl VolumeSnapshotContent {
    /// Handle of the backend snapshot, preferring the status the driver reported
    pub fn snapshot_handle(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.snapshot_handle.as_deref())
            .or(self.spec.source.snapshot_handle.as_deref())
            .filter(|h| !h.is_empty())
    }
}

impl VolumeSnapshot {
    /// Name of the bound content, from status or a pre-provisioned source
    pub fn content_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.bound_volume_snapshot_content_name.as_deref())
            .or(self.spec.source.volume_snapshot_content_name.as_deref())
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    pub fn has_error(&self) -> bool {
        self.status.as_ref().map_or(false, |s| s.error.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_volume_snapshot() {
        let raw = serde_json::json!({
            "apiVersion": "snapshot.storage.k8s.io/v1",
            "kind": "VolumeSnapshot",
            "metadata": {"name": "nightly", "namespace": "apps"},
            "spec": {
                "source": {"persistentVolumeClaimName": "data"},
                "volumeSnapshotClassName": "truenas"
            },
            "status": {
                "boundVolumeSnapshotContentName": "snapcontent-123",
                "readyToUse": true,
                "restoreSize": "10Gi"
            }
        });
        let snap: VolumeSnapshot = serde_json::from_value(raw).unwrap();
        assert_eq!(snap.content_name(), Some("snapcontent-123"));
        assert!(snap.is_ready());
        assert!(!snap.has_error());
    }

    #[test]
    fn test_content_snapshot_handle() {
        let raw = serde_json::json!({
            "apiVersion": "snapshot.storage.k8s.io/v1",
            "kind": "VolumeSnapshotContent",
            "metadata": {"name": "snapcontent-123"},
            "spec": {
                "driver": "org.democratic-csi.nfs",
                "deletionPolicy": "Delete",
                "source": {"volumeHandle": "pvc-1"},
                "volumeSnapshotRef": {"name": "nightly", "namespace": "apps"}
            },
            "status": {
                "snapshotHandle": "tank/k8s/pvc-1@snapshot-abc",
                "creationTime": 1700000000000000000i64,
                "readyToUse": true
            }
        });
        let content: VolumeSnapshotContent = serde_json::from_value(raw).unwrap();
        assert_eq!(content.snapshot_handle(), Some("tank/k8s/pvc-1@snapshot-abc"));
    }
}
