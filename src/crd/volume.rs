//! Volume CRD
//!
//! Represents a logical, cloud-backed volume together with the provisioning
//! result once the underlying disk exists.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer that blocks removal of a Volume until its disk is cleaned up
pub const VOLUME_FINALIZER: &str = "storage.billyronks.io/volume-finalizer";

// =============================================================================
// Volume CRD
// =============================================================================

/// Volume tracks one cloud disk managed by the driver: its desired capacity,
/// the number of standby mount replicas to keep, and the provisioning result.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "Volume",
    plural = "volumes",
    shortname = "bvol",
    status = "VolumeStatus",
    namespaced,
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.maxMountReplicaCount"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Name of the underlying persistent volume
    pub volume_name: String,

    /// Requested capacity
    #[serde(default)]
    pub capacity_range: CapacityRange,

    /// Number of standby replica attachments to keep
    #[serde(default)]
    pub max_mount_replica_count: u32,

    /// Requested access capabilities
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,

    /// Driver parameters from the storage class
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Secrets passed through to the provisioner
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,

    /// Snapshot or volume to populate the new disk from
    #[serde(default)]
    pub content_source: Option<ContentSource>,

    /// Topology the disk must be reachable from
    #[serde(default)]
    pub accessibility_requirement: Option<TopologyRequirement>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Capacity bounds in bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRange {
    /// Minimum size of the disk
    #[serde(default)]
    pub required_bytes: i64,

    /// Maximum size of the disk (0 = unbounded)
    #[serde(default)]
    pub limit_bytes: i64,
}

/// Access capability requested for the volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCapability {
    /// Access mode
    pub access_mode: AccessMode,

    /// Whether the volume is consumed as a raw block device
    #[serde(default)]
    pub block: bool,

    /// Filesystem type for mount access
    #[serde(default)]
    pub fs_type: Option<String>,
}

/// Access mode of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// Source a new disk is populated from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentSource {
    /// Kind of source
    pub kind: ContentSourceKind,

    /// Identifier of the snapshot or volume
    pub source_id: String,
}

/// Kind of content source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ContentSourceKind {
    Snapshot,
    Volume,
}

/// Topology requirement for the disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopologyRequirement {
    /// Topologies the disk must be accessible from
    #[serde(default)]
    pub requisite: Vec<BTreeMap<String, String>>,

    /// Topologies to try first
    #[serde(default)]
    pub preferred: Vec<BTreeMap<String, String>>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the Volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// Lifecycle state
    #[serde(default)]
    pub state: VolumeState,

    /// Binding phase mirrored from the persistent volume
    #[serde(default)]
    pub phase: Option<VolumePhase>,

    /// Provisioning result, present once the disk exists
    #[serde(default)]
    pub detail: Option<VolumeDetail>,

    /// Last provisioning error
    #[serde(default)]
    pub error: Option<VolumeError>,
}

/// Volume lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumeState {
    #[default]
    Pending,
    Creating,
    Created,
    CreationFailed,
    Updating,
    UpdateFailed,
    Deleting,
    Deleted,
    DeletionFailed,
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Pending => write!(f, "Pending"),
            VolumeState::Creating => write!(f, "Creating"),
            VolumeState::Created => write!(f, "Created"),
            VolumeState::CreationFailed => write!(f, "CreationFailed"),
            VolumeState::Updating => write!(f, "Updating"),
            VolumeState::UpdateFailed => write!(f, "UpdateFailed"),
            VolumeState::Deleting => write!(f, "Deleting"),
            VolumeState::Deleted => write!(f, "Deleted"),
            VolumeState::DeletionFailed => write!(f, "DeletionFailed"),
        }
    }
}

/// Binding phase of the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumePhase {
    Pending,
    Available,
    Bound,
    Released,
    Failed,
}

impl VolumePhase {
    /// Map a persistent volume phase string onto a volume phase
    pub fn from_pv_phase(phase: &str) -> Option<Self> {
        match phase {
            "Pending" => Some(VolumePhase::Pending),
            "Available" => Some(VolumePhase::Available),
            "Bound" => Some(VolumePhase::Bound),
            "Released" => Some(VolumePhase::Released),
            "Failed" => Some(VolumePhase::Failed),
            _ => None,
        }
    }
}

/// Result of a successful create or expand
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDetail {
    /// Identifier assigned by the cloud provider
    pub volume_id: String,

    /// Actual size of the disk
    pub capacity_bytes: i64,

    /// Context returned by the provisioner
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,

    /// Source the disk was populated from
    #[serde(default)]
    pub content_source: Option<ContentSource>,

    /// Topologies the disk is reachable from
    #[serde(default)]
    pub accessible_topology: Vec<BTreeMap<String, String>>,
}

/// Error recorded from the last failed provisioning call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeError {
    /// Operation that failed
    pub operation: String,
    /// Error message
    pub message: String,
}

// =============================================================================
// Implementations
// =============================================================================

impl Volume {
    /// Build a new Volume object in `namespace`
    pub fn build(name: &str, namespace: &str, spec: VolumeSpec) -> Self {
        let mut volume = Volume::new(name, spec);
        volume.metadata.namespace = Some(namespace.to_string());
        volume
    }

    /// Current lifecycle state
    pub fn state(&self) -> VolumeState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Provisioning result, if the disk exists
    pub fn detail(&self) -> Option<&VolumeDetail> {
        self.status.as_ref().and_then(|s| s.detail.as_ref())
    }

    /// Whether the disk has been materialized
    pub fn is_created(&self) -> bool {
        self.detail().is_some()
    }

    /// Whether the volume has been released by its claim
    pub fn is_released(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .map(|p| p == VolumePhase::Released)
            .unwrap_or(false)
    }

    /// Whether deletion of this object has been requested
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the volume finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == VOLUME_FINALIZER)
    }

    /// Whether the spec asks for more capacity than the disk has
    pub fn needs_expansion(&self) -> bool {
        self.detail()
            .map(|d| self.spec.capacity_range.required_bytes > d.capacity_bytes)
            .unwrap_or(false)
    }
}
