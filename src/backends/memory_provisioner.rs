//! In-Memory Volume Provisioner
//!
//! Tracks disks in process memory. Used by tests and standalone mode in place
//! of a cloud API; failures can be injected per operation.

use crate::crd::{CapacityRange, VolumeDetail};
use crate::domain::ports::{CreateVolumeRequest, PublishVolumeRequest, VolumeProvisioner};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// Disk State
// =============================================================================

/// Internal tracking of provisioned disks
#[derive(Debug, Clone)]
struct DiskState {
    name: String,
    detail: VolumeDetail,
    published_to: BTreeSet<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// In-Memory Provisioner
// =============================================================================

/// Provisioner that keeps disks in memory
pub struct InMemoryProvisioner {
    disks: RwLock<BTreeMap<String, DiskState>>,
    next_id: AtomicU64,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, String>>,
}

impl Default for InMemoryProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self {
            disks: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Number of calls made for `operation` (e.g. `"create_volume"`)
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    /// Make every call of `operation` fail with `reason` until cleared
    pub fn fail_operation(&self, operation: &'static str, reason: impl Into<String>) {
        self.failures.lock().insert(operation, reason.into());
    }

    /// Stop injecting failures for `operation`
    pub fn clear_failure(&self, operation: &str) {
        self.failures.lock().remove(operation);
    }

    /// Number of disks currently provisioned
    pub async fn disk_count(&self) -> usize {
        self.disks.read().await.len()
    }

    /// Nodes a disk is published to
    pub async fn published_nodes(&self, volume_id: &str) -> Vec<String> {
        self.disks
            .read()
            .await
            .get(volume_id)
            .map(|d| d.published_to.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, operation: &'static str, volume: &str) -> Result<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;

        match self.failures.lock().get(operation) {
            Some(reason) => Err(Error::ProvisioningFailed {
                operation: operation.to_string(),
                volume: volume.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VolumeProvisioner for InMemoryProvisioner {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<VolumeDetail> {
        self.record("create_volume", &request.name)?;

        let mut disks = self.disks.write().await;

        // Creation is idempotent by name
        if let Some(existing) = disks.values().find(|d| d.name == request.name) {
            return Ok(existing.detail.clone());
        }

        let volume_id = format!(
            "disk-{:06}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let detail = VolumeDetail {
            volume_id: volume_id.clone(),
            capacity_bytes: request.capacity_range.required_bytes,
            volume_context: request.parameters.clone(),
            content_source: request.content_source.clone(),
            accessible_topology: request
                .accessibility_requirement
                .map(|t| t.requisite)
                .unwrap_or_default(),
        };

        info!(
            "Created disk {} for {} ({} bytes)",
            volume_id, request.name, detail.capacity_bytes
        );

        disks.insert(
            volume_id,
            DiskState {
                name: request.name,
                detail: detail.clone(),
                published_to: BTreeSet::new(),
                created_at: chrono::Utc::now(),
            },
        );

        Ok(detail)
    }

    async fn delete_volume(
        &self,
        volume_id: &str,
        _secrets: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.record("delete_volume", volume_id)?;

        // Deleting a missing disk succeeds
        if let Some(disk) = self.disks.write().await.remove(volume_id) {
            info!(
                "Deleted disk {} ({}), created at {}",
                volume_id, disk.name, disk.created_at
            );
        }
        Ok(())
    }

    async fn expand_volume(
        &self,
        volume_id: &str,
        capacity_range: &CapacityRange,
        _secrets: &BTreeMap<String, String>,
    ) -> Result<VolumeDetail> {
        self.record("expand_volume", volume_id)?;

        let mut disks = self.disks.write().await;
        let disk = disks
            .get_mut(volume_id)
            .ok_or_else(|| Error::CloudVolumeNotFound {
                volume_id: volume_id.to_string(),
            })?;

        if capacity_range.required_bytes > disk.detail.capacity_bytes {
            debug!(
                "Expanding disk {} from {} to {} bytes",
                volume_id, disk.detail.capacity_bytes, capacity_range.required_bytes
            );
            disk.detail.capacity_bytes = capacity_range.required_bytes;
        }
        Ok(disk.detail.clone())
    }

    async fn publish_volume(
        &self,
        request: PublishVolumeRequest,
    ) -> Result<BTreeMap<String, String>> {
        self.record("publish_volume", &request.volume_id)?;

        let mut disks = self.disks.write().await;
        let disk = disks
            .get_mut(&request.volume_id)
            .ok_or_else(|| Error::CloudVolumeNotFound {
                volume_id: request.volume_id.clone(),
            })?;
        disk.published_to.insert(request.node_id.clone());

        let lun = disk.published_to.len() - 1;
        Ok(BTreeMap::from([
            ("LUN".to_string(), lun.to_string()),
            ("readonly".to_string(), request.readonly.to_string()),
        ]))
    }

    async fn unpublish_volume(&self, volume_id: &str, node_id: &str) -> Result<()> {
        self.record("unpublish_volume", volume_id)?;

        if let Some(disk) = self.disks.write().await.get_mut(volume_id) {
            disk.published_to.remove(node_id);
        }
        Ok(())
    }

    fn provisioner_name(&self) -> &str {
        "in-memory"
    }
}
