//! Attachment Reconciler
//!
//! Drives Attachments through attach, promotion, demotion and detach, and
//! hands volume-level consequences to the garbage collector (primary gone)
//! and the replica manager (promotion, replica lost).

use super::attach::{detach, observe_role, publish, sync_role_label, volume_selector};
use super::gc::GarbageCollector;
use super::replica::ReplicaManager;
use crate::crd::{Attachment, Role};
use crate::domain::ports::{ObjectStoreRef, VolumeProvisionerRef};
use crate::error::{Error, Result};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Reconciles Attachment objects
pub struct AttachmentReconciler {
    store: ObjectStoreRef,
    provisioner: VolumeProvisionerRef,
    gc: Arc<GarbageCollector>,
    replicas: Arc<ReplicaManager>,
}

impl AttachmentReconciler {
    pub fn new(
        store: ObjectStoreRef,
        provisioner: VolumeProvisionerRef,
        gc: Arc<GarbageCollector>,
        replicas: Arc<ReplicaManager>,
    ) -> Self {
        Self {
            store,
            provisioner,
            gc,
            replicas,
        }
    }

    /// Reconcile the Attachment called `name`
    #[instrument(skip(self), fields(attachment = %name))]
    pub async fn reconcile(&self, name: &str) -> Result<()> {
        let attachment = match self.store.get_attachment(name).await {
            Ok(attachment) => attachment,
            Err(e) if e.is_not_found() => {
                debug!("Attachment {} is gone", name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let volume = attachment.spec.volume_name.clone();

        if attachment.deletion_requested() {
            match attachment.spec.role {
                Role::Primary => {
                    self.gc.trigger(&volume);
                }
                Role::Replica if !attachment.is_cleaned_up() => {
                    info!(
                        "Replica of volume {} on node {} was deleted, scheduling a replacement",
                        volume, attachment.spec.node_name
                    );
                    self.replicas.spawn_replacement(&attachment);
                }
                Role::Replica => {}
            }
            return detach(self.store.as_ref(), self.provisioner.as_ref(), attachment).await;
        }

        let attachment = sync_role_label(self.store.as_ref(), attachment).await?;
        match attachment.spec.role {
            Role::Primary => {
                self.gc.cancel(&volume);

                if !attachment.is_attached() {
                    self.ensure_sole_primary(&attachment).await?;
                    publish(self.store.as_ref(), self.provisioner.as_ref(), attachment).await?;
                    self.replicas.manage_replicas(&volume).await?;
                } else if attachment.observed_role() != Some(Role::Primary) {
                    self.ensure_sole_primary(&attachment).await?;
                    info!(
                        "Promoted volume {} on node {}, backfilling replicas",
                        volume, attachment.spec.node_name
                    );
                    // The promotion is only recorded once the backfill succeeded
                    self.replicas.manage_replicas(&volume).await?;
                    observe_role(self.store.as_ref(), attachment, Role::Primary).await?;
                }
            }
            Role::Replica => {
                if attachment.is_attached() && attachment.observed_role() == Some(Role::Primary) {
                    info!(
                        "Demoted volume {} on node {}",
                        volume, attachment.spec.node_name
                    );
                    observe_role(self.store.as_ref(), attachment, Role::Replica).await?;
                }
            }
        }
        Ok(())
    }

    /// Fails while another live attachment of the volume is still observed
    /// as primary. The old primary has to be demoted or deleted first.
    async fn ensure_sole_primary(&self, attachment: &Attachment) -> Result<()> {
        let name = attachment.name_any();
        let volume = &attachment.spec.volume_name;
        let siblings = self.store.list_attachments(&volume_selector(volume)).await?;

        let serving = siblings.iter().find(|other| {
            other.name_any() != name
                && !other.deletion_requested()
                && other.observed_role() == Some(Role::Primary)
        });
        match serving {
            Some(other) => Err(Error::aborted(format!(
                "volume {} is still served as primary on node {}",
                volume, other.spec.node_name
            ))),
            None => Ok(()),
        }
    }
}
