//! Attach, Detach and Cleanup
//!
//! Operations on Attachment objects shared by the reconcilers, the replica
//! manager and the garbage collector.

use crate::crd::{
    AttachmentDetail, AttachmentState, AttachmentStatus, Attachment, Role, ATTACHMENT_FINALIZER,
    CLEAN_UP_ANNOTATION, ROLE_LABEL, VOLUME_NAME_LABEL,
};
use crate::domain::ports::{LabelSelector, ObjectStore, PublishVolumeRequest, VolumeProvisioner};
use crate::error::Result;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// Attempts at annotating an attachment before giving up on conflicts
const ANNOTATE_ATTEMPTS: usize = 3;

/// Which attachments of a volume a cleanup covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupScope {
    /// Primary and replica attachments
    All,
    /// Replica attachments only
    Replicas,
}

/// Selector for every attachment of `volume`
pub fn volume_selector(volume: &str) -> LabelSelector {
    LabelSelector::new().with(VOLUME_NAME_LABEL, volume)
}

/// Selector for the replica attachments of `volume`
pub fn replica_selector(volume: &str) -> LabelSelector {
    volume_selector(volume).with(ROLE_LABEL, Role::Replica.as_str())
}

// =============================================================================
// Attach / Detach
// =============================================================================

/// Publish the disk to the attachment's node and record the observed role.
///
/// A failed publish is recorded as `AttachmentFailed` and returned.
pub async fn publish(
    store: &dyn ObjectStore,
    provisioner: &dyn VolumeProvisioner,
    mut attachment: Attachment,
) -> Result<Attachment> {
    let request = PublishVolumeRequest {
        volume_id: attachment.spec.volume_id.clone(),
        node_id: attachment.spec.node_name.clone(),
        volume_capability: None,
        readonly: false,
        volume_context: attachment.spec.volume_context.clone(),
    };

    match provisioner.publish_volume(request).await {
        Ok(publish_context) => {
            attachment.status = Some(AttachmentStatus {
                state: AttachmentState::Attached,
                detail: Some(AttachmentDetail {
                    role: attachment.spec.role,
                    publish_context,
                }),
            });
            info!(
                "Attached {} to node {} as {}",
                attachment.spec.volume_name, attachment.spec.node_name, attachment.spec.role
            );
            store.replace_attachment_status(&attachment).await
        }
        Err(e) => {
            warn!("Failed to attach {}: {}", attachment.name_any(), e);
            attachment.status = Some(AttachmentStatus {
                state: AttachmentState::AttachmentFailed,
                detail: None,
            });
            if let Err(status_err) = store.replace_attachment_status(&attachment).await {
                debug!(
                    "Could not record attach failure on {}: {}",
                    attachment.name_any(),
                    status_err
                );
            }
            Err(e)
        }
    }
}

/// Point the role label back at the requested role. Replica counting and
/// cleanup select on the label, so it has to follow `spec.role`.
pub async fn sync_role_label(
    store: &dyn ObjectStore,
    mut attachment: Attachment,
) -> Result<Attachment> {
    let role = attachment.spec.role.as_str();
    if attachment.labels().get(ROLE_LABEL).map(String::as_str) == Some(role) {
        return Ok(attachment);
    }
    debug!("Relabeling {} as {}", attachment.name_any(), role);
    attachment
        .labels_mut()
        .insert(ROLE_LABEL.to_string(), role.to_string());
    store.replace_attachment(&attachment).await
}

/// Record that the node now serves `role`
pub async fn observe_role(
    store: &dyn ObjectStore,
    mut attachment: Attachment,
    role: Role,
) -> Result<Attachment> {
    let status = attachment.status.get_or_insert_with(AttachmentStatus::default);
    match status.detail.as_mut() {
        Some(detail) => detail.role = role,
        None => return Ok(attachment),
    }
    store.replace_attachment_status(&attachment).await
}

/// Unpublish the disk and release the detach finalizer
pub async fn detach(
    store: &dyn ObjectStore,
    provisioner: &dyn VolumeProvisioner,
    mut attachment: Attachment,
) -> Result<()> {
    if !attachment.has_finalizer() {
        return Ok(());
    }

    let published = attachment
        .status
        .as_ref()
        .map(|s| s.detail.is_some() || s.state == AttachmentState::Attached)
        .unwrap_or(false);
    if published {
        provisioner
            .unpublish_volume(&attachment.spec.volume_id, &attachment.spec.node_name)
            .await?;
        info!(
            "Detached {} from node {}",
            attachment.spec.volume_name, attachment.spec.node_name
        );
    }

    attachment
        .finalizers_mut()
        .retain(|f| f != ATTACHMENT_FINALIZER);
    match store.replace_attachment(&attachment).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Cleanup
// =============================================================================

/// Mark and delete the attachments of `volume` covered by `scope`.
///
/// The clean-up annotation is written before deletion so no replacement
/// replica is spawned for them. Returns the number of deletions requested.
pub async fn cleanup_attachments(
    store: &dyn ObjectStore,
    volume: &str,
    scope: CleanupScope,
) -> Result<usize> {
    let selector = match scope {
        CleanupScope::All => volume_selector(volume),
        CleanupScope::Replicas => replica_selector(volume),
    };

    let mut requested = 0;
    for attachment in store.list_attachments(&selector).await? {
        if attachment.deletion_requested() {
            continue;
        }
        let name = attachment.name_any();

        if !attachment.is_cleaned_up() && !annotate_for_cleanup(store, attachment).await? {
            continue;
        }

        match store.delete_attachment(&name).await {
            Ok(()) => requested += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    if requested > 0 {
        info!(
            "Requested deletion of {} attachment(s) of volume {} ({:?})",
            requested, volume, scope
        );
    }
    Ok(requested)
}

/// Add the clean-up annotation. Returns false when the object is gone.
async fn annotate_for_cleanup(store: &dyn ObjectStore, mut attachment: Attachment) -> Result<bool> {
    let name = attachment.name_any();
    let mut attempt = 0;
    loop {
        attempt += 1;
        attachment
            .annotations_mut()
            .insert(CLEAN_UP_ANNOTATION.to_string(), "true".to_string());

        match store.replace_attachment(&attachment).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_not_found() => return Ok(false),
            Err(crate::error::Error::Conflict { .. }) if attempt < ANNOTATE_ATTEMPTS => {
                attachment = match store.get_attachment(&name).await {
                    Ok(fresh) => fresh,
                    Err(e) if e.is_not_found() => return Ok(false),
                    Err(e) => return Err(e),
                };
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryProvisioner, InMemoryStore};
    use crate::domain::ports::CreateVolumeRequest;

    fn seed(store: &InMemoryStore, volume: &str, node: &str, role: Role, attached: bool) {
        let mut attachment = Attachment::build("test", volume, "disk-0", node, role);
        if attached {
            attachment.status = Some(AttachmentStatus {
                state: AttachmentState::Attached,
                detail: Some(AttachmentDetail {
                    role,
                    publish_context: Default::default(),
                }),
            });
        }
        store.insert_attachment(attachment);
    }

    #[tokio::test]
    async fn test_cleanup_replicas_leaves_primary() {
        let store = InMemoryStore::new("test");
        seed(&store, "pv-0", "node-0", Role::Primary, true);
        seed(&store, "pv-0", "node-1", Role::Replica, true);
        seed(&store, "pv-0", "node-2", Role::Replica, false);
        seed(&store, "pv-1", "node-1", Role::Replica, true);

        let requested = cleanup_attachments(&store, "pv-0", CleanupScope::Replicas)
            .await
            .unwrap();
        assert_eq!(requested, 2);

        let primary = store.attachment("pv-0-node-0-attachment").unwrap();
        assert!(!primary.deletion_requested());
        let replica = store.attachment("pv-0-node-1-attachment").unwrap();
        assert!(replica.deletion_requested());
        assert!(replica.is_cleaned_up());
        assert!(!store.attachment("pv-1-node-1-attachment").unwrap().deletion_requested());

        // Already deleting attachments are skipped
        let again = cleanup_attachments(&store, "pv-0", CleanupScope::Replicas)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_publish_and_detach() {
        let store = InMemoryStore::new("test");
        let provisioner = InMemoryProvisioner::new();
        let detail = provisioner
            .create_volume(CreateVolumeRequest {
                name: "pv-0".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let attachment = Attachment::build("test", "pv-0", &detail.volume_id, "node-0", Role::Replica);
        let created = store.create_attachment(&attachment).await.unwrap();

        let attached = publish(&store, &provisioner, created).await.unwrap();
        assert!(attached.is_attached());
        assert_eq!(attached.observed_role(), Some(Role::Replica));
        assert_eq!(provisioner.published_nodes(&detail.volume_id).await, vec!["node-0"]);

        store.delete_attachment(&attached.name_any()).await.unwrap();
        let deleting = store.attachment(&attached.name_any()).unwrap();
        detach(&store, &provisioner, deleting).await.unwrap();

        assert!(store.attachment(&attached.name_any()).is_none());
        assert!(provisioner.published_nodes(&detail.volume_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_is_recorded() {
        let store = InMemoryStore::new("test");
        let provisioner = InMemoryProvisioner::new();
        let attachment = Attachment::build("test", "pv-0", "missing", "node-0", Role::Primary);
        let created = store.create_attachment(&attachment).await.unwrap();

        assert!(publish(&store, &provisioner, created).await.is_err());
        let stored = store.attachment("pv-0-node-0-attachment").unwrap();
        assert_eq!(
            stored.status.map(|s| s.state),
            Some(AttachmentState::AttachmentFailed)
        );
    }
}
