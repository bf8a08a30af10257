//! Domain Ports - Core trait definitions for the volume operator
//!
//! These traits define the boundaries between the reconciliation logic and the
//! external systems it drives: the cluster object store and the cloud volume
//! provisioner. Adapters in [`crate::backends`] implement them.

use crate::crd::{
    Attachment, CapacityRange, ContentSource, TopologyRequirement, Volume, VolumeCapability,
    VolumeDetail,
};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::StorageClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Label Selector
// =============================================================================

/// Equality-based label selector used to list attachments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    matches: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.matches.insert(key.into(), value.into());
        self
    }

    /// Whether an object with `labels` satisfies the selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.matches
            .iter()
            .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }

    /// Render in the `k=v,k2=v2` form the API server expects
    pub fn to_query(&self) -> String {
        self.matches
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_query())
    }
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Port for the cluster object store.
///
/// Lookups of missing objects fail with `Error::ResourceNotFound`, creation of
/// an existing name with `Error::ResourceExists`, and writes carrying a stale
/// resourceVersion with `Error::Conflict`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a Volume by name
    async fn get_volume(&self, name: &str) -> Result<Volume>;

    /// List all Volumes
    async fn list_volumes(&self) -> Result<Vec<Volume>>;

    /// Create a Volume
    async fn create_volume(&self, volume: &Volume) -> Result<Volume>;

    /// Replace a Volume's metadata and spec
    async fn replace_volume(&self, volume: &Volume) -> Result<Volume>;

    /// Replace a Volume's status subresource
    async fn replace_volume_status(&self, volume: &Volume) -> Result<Volume>;

    /// Request deletion of a Volume
    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Fetch an Attachment by name
    async fn get_attachment(&self, name: &str) -> Result<Attachment>;

    /// List Attachments matching `selector`
    async fn list_attachments(&self, selector: &LabelSelector) -> Result<Vec<Attachment>>;

    /// Create an Attachment
    async fn create_attachment(&self, attachment: &Attachment) -> Result<Attachment>;

    /// Replace an Attachment's metadata and spec
    async fn replace_attachment(&self, attachment: &Attachment) -> Result<Attachment>;

    /// Replace an Attachment's status subresource
    async fn replace_attachment_status(&self, attachment: &Attachment) -> Result<Attachment>;

    /// Request deletion of an Attachment
    async fn delete_attachment(&self, name: &str) -> Result<()>;

    /// List all PersistentVolumes
    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>>;

    /// Fetch a StorageClass by name
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass>;
}

// =============================================================================
// Provisioning Request/Response
// =============================================================================

/// Request to create a cloud disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Name of the disk
    pub name: String,
    /// Capacity bounds
    pub capacity_range: CapacityRange,
    /// Requested access capabilities
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Driver parameters
    pub parameters: BTreeMap<String, String>,
    /// Provisioner secrets
    #[serde(skip_serializing)]
    pub secrets: BTreeMap<String, String>,
    /// Source to populate from
    pub content_source: Option<ContentSource>,
    /// Topology requirement
    pub accessibility_requirement: Option<TopologyRequirement>,
}

impl CreateVolumeRequest {
    /// Build a request from a Volume's spec
    pub fn for_volume(volume: &Volume) -> Self {
        Self {
            name: volume.spec.volume_name.clone(),
            capacity_range: volume.spec.capacity_range.clone(),
            volume_capabilities: volume.spec.volume_capabilities.clone(),
            parameters: volume.spec.parameters.clone(),
            secrets: volume.spec.secrets.clone(),
            content_source: volume.spec.content_source.clone(),
            accessibility_requirement: volume.spec.accessibility_requirement.clone(),
        }
    }
}

/// Request to publish a disk to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishVolumeRequest {
    /// Cloud identifier of the disk
    pub volume_id: String,
    /// Node to publish to
    pub node_id: String,
    /// Access capability
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the node gets read-only access
    pub readonly: bool,
    /// Volume context
    pub volume_context: BTreeMap<String, String>,
}

// =============================================================================
// Volume Provisioner Port
// =============================================================================

/// Port for cloud disk operations
#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    /// Create a disk and return its materialized detail
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<VolumeDetail>;

    /// Delete a disk
    async fn delete_volume(&self, volume_id: &str, secrets: &BTreeMap<String, String>)
        -> Result<()>;

    /// Grow a disk, returning the new detail
    async fn expand_volume(
        &self,
        volume_id: &str,
        capacity_range: &CapacityRange,
        secrets: &BTreeMap<String, String>,
    ) -> Result<VolumeDetail>;

    /// Attach a disk to a node, returning the publish context
    async fn publish_volume(
        &self,
        request: PublishVolumeRequest,
    ) -> Result<BTreeMap<String, String>>;

    /// Detach a disk from a node
    async fn unpublish_volume(&self, volume_id: &str, node_id: &str) -> Result<()>;

    /// Get provisioner name
    fn provisioner_name(&self) -> &str;
}

/// Shared handle to an object store
pub type ObjectStoreRef = Arc<dyn ObjectStore>;

/// Shared handle to a provisioner
pub type VolumeProvisionerRef = Arc<dyn VolumeProvisioner>;
