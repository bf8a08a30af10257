//! Volume Reconciler
//!
//! Drives Volumes through their lifecycle:
//!
//! ```text
//!   Pending ─▶ Creating ─▶ Created ─▶ Updating ─▶ Created
//!                 │           │          │
//!                 ▼           │          ▼
//!          CreationFailed     │     UpdateFailed
//!                             ▼
//!                         Deleting ─▶ Deleted
//!                             │
//!                             ▼
//!                       DeletionFailed
//! ```
//!
//! Deletion waits until no primary attachment reports attached. A volume
//! released by its claim loses its replica attachments.

use super::attach::{cleanup_attachments, volume_selector, CleanupScope};
use crate::crd::{
    AccessMode, CapacityRange, Role, Volume, VolumeCapability, VolumeDetail, VolumeError,
    VolumePhase, VolumeSpec, VolumeState, VolumeStatus, MAX_MOUNT_REPLICA_COUNT_PARAM,
    VOLUME_FINALIZER,
};
use crate::domain::ports::{CreateVolumeRequest, ObjectStoreRef, VolumeProvisionerRef};
use crate::error::{Error, Result};
use crate::registry::{object_key, LockRegistry, RelationshipIndex};
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Reconciles Volume objects
pub struct VolumeReconciler {
    namespace: String,
    driver_name: String,
    store: ObjectStoreRef,
    provisioner: VolumeProvisionerRef,
    index: Arc<RelationshipIndex>,
    volume_locks: Arc<LockRegistry>,
}

impl VolumeReconciler {
    pub fn new(
        namespace: impl Into<String>,
        driver_name: impl Into<String>,
        store: ObjectStoreRef,
        provisioner: VolumeProvisionerRef,
        index: Arc<RelationshipIndex>,
        volume_locks: Arc<LockRegistry>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            driver_name: driver_name.into(),
            store,
            provisioner,
            index,
            volume_locks,
        }
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    /// Reconcile the Volume called `name`
    #[instrument(skip(self), fields(volume = %name))]
    pub async fn reconcile(&self, name: &str) -> Result<()> {
        let _guard = self.volume_locks.lock(name).await;

        let mut volume = match self.store.get_volume(name).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => {
                debug!("Volume {} is gone", name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if volume.deletion_requested() {
            if !volume.has_finalizer() {
                return Ok(());
            }
            return self.delete(volume).await;
        }

        if !volume.has_finalizer() {
            volume
                .finalizers_mut()
                .push(VOLUME_FINALIZER.to_string());
            volume = self.store.replace_volume(&volume).await?;
            debug!("Added finalizer to volume {}", name);
        }

        if !volume.is_created() {
            return self.create(volume).await;
        }

        if volume.needs_expansion() {
            return self.expand(volume).await;
        }

        if volume.is_released() {
            let requested =
                cleanup_attachments(self.store.as_ref(), name, CleanupScope::Replicas).await?;
            if requested > 0 {
                info!(
                    "Volume {} was released, removing {} replica(s)",
                    name, requested
                );
            }
        }

        Ok(())
    }

    async fn create(&self, volume: Volume) -> Result<()> {
        let name = volume.name_any();
        let volume = self.set_state(volume, VolumeState::Creating).await?;

        match self
            .provisioner
            .create_volume(CreateVolumeRequest::for_volume(&volume))
            .await
        {
            Ok(detail) => {
                info!(
                    "Created volume {} as {} ({} bytes)",
                    name, detail.volume_id, detail.capacity_bytes
                );
                let mut volume = volume;
                let status = volume.status.get_or_insert_with(VolumeStatus::default);
                status.detail = Some(detail);
                status.state = VolumeState::Created;
                status.error = None;
                self.store.replace_volume_status(&volume).await?;
                Ok(())
            }
            Err(e) => {
                self.record_failure(volume, VolumeState::CreationFailed, "create", &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn expand(&self, volume: Volume) -> Result<()> {
        let name = volume.name_any();
        let volume = self.set_state(volume, VolumeState::Updating).await?;
        let Some(volume_id) = volume.detail().map(|d| d.volume_id.clone()) else {
            return Ok(());
        };

        match self
            .provisioner
            .expand_volume(&volume_id, &volume.spec.capacity_range, &volume.spec.secrets)
            .await
        {
            Ok(_) => {
                let requested = volume.spec.capacity_range.required_bytes;
                let mut volume = volume;
                let status = volume.status.get_or_insert_with(VolumeStatus::default);
                if let Some(detail) = status.detail.as_mut() {
                    info!(
                        "Expanded volume {} from {} to {} bytes",
                        name, detail.capacity_bytes, requested
                    );
                    detail.capacity_bytes = requested;
                }
                status.state = VolumeState::Created;
                status.error = None;
                self.store.replace_volume_status(&volume).await?;
                Ok(())
            }
            Err(e) => {
                self.record_failure(volume, VolumeState::UpdateFailed, "expand", &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn delete(&self, volume: Volume) -> Result<()> {
        let name = volume.name_any();

        let attachments = self
            .store
            .list_attachments(&volume_selector(&name))
            .await?;
        let primary_attached = attachments
            .iter()
            .any(|a| a.spec.role == Role::Primary && a.is_attached());
        if primary_attached {
            cleanup_attachments(self.store.as_ref(), &name, CleanupScope::All).await?;
            return Err(Error::aborted(
                "volume deletion requeued until attached attachments are entirely detached",
            ));
        }
        if !attachments.is_empty() {
            cleanup_attachments(self.store.as_ref(), &name, CleanupScope::All).await?;
        }

        let mut volume = self.set_state(volume, VolumeState::Deleting).await?;

        if let Some(detail) = volume.detail().cloned() {
            if let Err(e) = self
                .provisioner
                .delete_volume(&detail.volume_id, &volume.spec.secrets)
                .await
            {
                self.record_failure(volume, VolumeState::DeletionFailed, "delete", &e)
                    .await;
                return Err(e);
            }
            info!("Deleted disk {} of volume {}", detail.volume_id, name);
        }

        volume = self.set_state(volume, VolumeState::Deleted).await?;
        volume.finalizers_mut().retain(|f| f != VOLUME_FINALIZER);
        match self.store.replace_volume(&volume).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.index.remove_volume(&name);
        self.volume_locks.remove(&name);
        info!("Volume {} deleted", name);
        Ok(())
    }

    async fn set_state(&self, mut volume: Volume, state: VolumeState) -> Result<Volume> {
        let status = volume.status.get_or_insert_with(VolumeStatus::default);
        status.state = state;
        status.error = None;
        self.store.replace_volume_status(&volume).await
    }

    /// Record a failed provisioning call. The write is best effort: the
    /// original error is what the caller returns.
    async fn record_failure(
        &self,
        mut volume: Volume,
        state: VolumeState,
        operation: &str,
        error: &Error,
    ) {
        warn!(
            "Failed to {} volume {}: {}",
            operation,
            volume.name_any(),
            error
        );
        let status = volume.status.get_or_insert_with(VolumeStatus::default);
        status.state = state;
        status.error = Some(VolumeError {
            operation: operation.to_string(),
            message: error.to_string(),
        });
        if let Err(e) = self.store.replace_volume_status(&volume).await {
            debug!("Could not record {} on {}: {}", state, volume.name_any(), e);
        }
    }

    // =========================================================================
    // Phase
    // =========================================================================

    /// Mirror a persistent volume phase onto the Volume
    pub async fn update_phase(&self, name: &str, phase: VolumePhase) -> Result<bool> {
        let mut volume = match self.store.get_volume(name).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let status = volume.status.get_or_insert_with(VolumeStatus::default);
        if status.phase == Some(phase) {
            return Ok(false);
        }
        status.phase = Some(phase);
        self.store.replace_volume_status(&volume).await?;
        debug!("Volume {} is now {:?}", name, phase);
        Ok(true)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Recreate Volume objects for persistent volumes of this driver that
    /// have none, and index their claims. Returns the number created.
    ///
    /// A persistent volume that cannot be recovered does not stop the others;
    /// the failed names are reported together once every one was tried.
    pub async fn recover(&self) -> Result<usize> {
        let mut created = 0;
        let mut failed = Vec::new();

        for pv in self.store.list_persistent_volumes().await? {
            let Some(spec) = pv.spec.as_ref() else {
                continue;
            };
            let Some(csi) = spec.csi.as_ref() else {
                continue;
            };
            if csi.driver != self.driver_name {
                continue;
            }
            let name = pv.name_any();

            if let Some(claim) = spec.claim_ref.as_ref() {
                if let (Some(namespace), Some(claim_name)) = (&claim.namespace, &claim.name) {
                    self.index
                        .add_volume(&name, &object_key(namespace, claim_name));
                }
            }

            let result = match self.store.get_volume(&name).await {
                Ok(_) => continue,
                Err(e) if e.is_not_found() => self.recover_volume(&pv).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => created += 1,
                Err(e) if e.is_already_exists() => {}
                Err(e) => {
                    warn!("Failed to recover volume {}: {}", name, e);
                    failed.push(name);
                }
            }
        }

        info!("Recovered {} volume(s)", created);
        if !failed.is_empty() {
            return Err(Error::RecoveryIncomplete { failed });
        }
        Ok(created)
    }

    async fn recover_volume(&self, pv: &PersistentVolume) -> Result<()> {
        let name = pv.name_any();
        let spec = pv.spec.clone().unwrap_or_default();
        let csi = spec.csi.clone().unwrap_or_default();

        let capacity_bytes = match spec.capacity.as_ref().and_then(|c| c.get("storage")) {
            Some(quantity) => parse_quantity(&quantity.0)?,
            None => 0,
        };
        let max_mount_replica_count = match spec.storage_class_name.as_deref() {
            Some(class) => self.replica_count_for_class(class).await?,
            None => 0,
        };
        let volume_capabilities = spec
            .access_modes
            .iter()
            .flatten()
            .filter_map(|mode| access_mode_from_pv(mode))
            .map(|access_mode| VolumeCapability {
                access_mode,
                block: spec.volume_mode.as_deref() == Some("Block"),
                fs_type: csi.fs_type.clone(),
            })
            .collect();
        let volume_attributes = csi.volume_attributes.clone().unwrap_or_default();

        let mut volume = Volume::build(
            &name,
            &self.namespace,
            VolumeSpec {
                volume_name: name.clone(),
                capacity_range: CapacityRange {
                    required_bytes: capacity_bytes,
                    limit_bytes: 0,
                },
                max_mount_replica_count,
                volume_capabilities,
                parameters: volume_attributes.clone(),
                secrets: BTreeMap::new(),
                content_source: None,
                accessibility_requirement: None,
            },
        );
        volume
            .finalizers_mut()
            .push(VOLUME_FINALIZER.to_string());

        let mut volume = self.store.create_volume(&volume).await?;
        volume.status = Some(VolumeStatus {
            state: VolumeState::Created,
            phase: pv
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .and_then(VolumePhase::from_pv_phase),
            detail: Some(VolumeDetail {
                volume_id: csi.volume_handle.clone(),
                capacity_bytes,
                volume_context: volume_attributes,
                content_source: None,
                accessible_topology: Vec::new(),
            }),
            error: None,
        });
        self.store.replace_volume_status(&volume).await?;

        info!(
            "Recovered volume {} ({}, {} replica(s))",
            name, csi.volume_handle, max_mount_replica_count
        );
        Ok(())
    }

    async fn replica_count_for_class(&self, class: &str) -> Result<u32> {
        let storage_class = match self.store.get_storage_class(class).await {
            Ok(storage_class) => storage_class,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };
        let value = storage_class
            .parameters
            .as_ref()
            .and_then(|p| p.get(MAX_MOUNT_REPLICA_COUNT_PARAM));
        Ok(match value {
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!(
                    "Ignoring invalid {} {:?} on storage class {}",
                    MAX_MOUNT_REPLICA_COUNT_PARAM, v, class
                );
                0
            }),
            None => 0,
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn access_mode_from_pv(mode: &str) -> Option<AccessMode> {
    match mode {
        "ReadWriteOnce" | "ReadWriteOncePod" => Some(AccessMode::SingleNodeWriter),
        "ReadOnlyMany" => Some(AccessMode::MultiNodeReaderOnly),
        "ReadWriteMany" => Some(AccessMode::MultiNodeMultiWriter),
        _ => None,
    }
}

/// Parse a resource quantity such as `10Gi`, `500M` or `1073741824` into bytes
pub fn parse_quantity(quantity: &str) -> Result<i64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);

    let multiplier: i64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown suffix in quantity {:?}",
                quantity
            )))
        }
    };

    if let Ok(whole) = number.parse::<i64>() {
        return whole.checked_mul(multiplier).ok_or_else(|| {
            Error::CapacityParse(format!("quantity {:?} overflows", quantity))
        });
    }

    let fractional: f64 = number
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid quantity {:?}", quantity)))?;
    let bytes = (fractional * multiplier as f64).ceil();
    if !bytes.is_finite() || bytes < 0.0 || bytes > i64::MAX as f64 {
        return Err(Error::CapacityParse(format!(
            "quantity {:?} out of range",
            quantity
        )));
    }
    Ok(bytes as i64)
}
