//! Attachment Watch Events
//!
//! Watch notifications for Attachments and the filter deciding which of them
//! reach the attachment reconciler.

use crate::crd::{Attachment, Role};
use kube::ResourceExt;

/// A change to an Attachment as seen by a watch
#[derive(Debug, Clone)]
pub enum AttachmentEvent {
    /// First observation of the object
    Create(Attachment),
    /// Modification, with the previously observed snapshot
    Update { old: Attachment, new: Attachment },
    /// Deletion was requested, or the object is gone
    Delete(Attachment),
}

impl AttachmentEvent {
    /// Classify an add or modify notification.
    ///
    /// The first observation of a deletion timestamp counts as a delete: with
    /// the detach finalizer in place that is when deletion starts.
    pub fn applied(old: Option<Attachment>, new: Attachment) -> Self {
        match old {
            Some(old) if !old.deletion_requested() && new.deletion_requested() => {
                AttachmentEvent::Delete(new)
            }
            Some(old) => AttachmentEvent::Update { old, new },
            None if new.deletion_requested() => AttachmentEvent::Delete(new),
            None => AttachmentEvent::Create(new),
        }
    }

    /// Classify a removal notification
    pub fn removed(last: Attachment) -> Self {
        AttachmentEvent::Delete(last)
    }

    /// Object the event refers to (the newest snapshot)
    pub fn object(&self) -> &Attachment {
        match self {
            AttachmentEvent::Create(obj) => obj,
            AttachmentEvent::Update { new, .. } => new,
            AttachmentEvent::Delete(obj) => obj,
        }
    }

    /// Name of the object the event refers to
    pub fn name(&self) -> String {
        self.object().name_any()
    }
}

/// Decide whether an event is worth a reconcile.
///
/// - create: only requests for the primary role
/// - update: only when the requested role changed (promotion or demotion)
/// - delete: always
pub fn should_enqueue(event: &AttachmentEvent) -> bool {
    match event {
        AttachmentEvent::Create(obj) => obj.spec.role == Role::Primary,
        AttachmentEvent::Update { old, new } => old.spec.role != new.spec.role,
        AttachmentEvent::Delete(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn attachment(role: Role) -> Attachment {
        Attachment::build("ns", "pv-0", "disk-0", "node-0", role)
    }

    fn deleting(role: Role) -> Attachment {
        let mut obj = attachment(role);
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        obj
    }

    #[test]
    fn test_filter_truth_table() {
        assert!(should_enqueue(&AttachmentEvent::Create(attachment(Role::Primary))));
        assert!(!should_enqueue(&AttachmentEvent::Create(attachment(Role::Replica))));

        assert!(should_enqueue(&AttachmentEvent::Update {
            old: attachment(Role::Replica),
            new: attachment(Role::Primary),
        }));
        assert!(should_enqueue(&AttachmentEvent::Update {
            old: attachment(Role::Primary),
            new: attachment(Role::Replica),
        }));
        assert!(!should_enqueue(&AttachmentEvent::Update {
            old: attachment(Role::Primary),
            new: attachment(Role::Primary),
        }));
        assert!(!should_enqueue(&AttachmentEvent::Update {
            old: attachment(Role::Replica),
            new: attachment(Role::Replica),
        }));

        assert!(should_enqueue(&AttachmentEvent::Delete(attachment(Role::Primary))));
        assert!(should_enqueue(&AttachmentEvent::Delete(attachment(Role::Replica))));
    }

    #[test]
    fn test_deletion_request_classified_as_delete() {
        let event = AttachmentEvent::applied(Some(attachment(Role::Replica)), deleting(Role::Replica));
        assert!(matches!(event, AttachmentEvent::Delete(_)));

        let event = AttachmentEvent::applied(Some(deleting(Role::Replica)), deleting(Role::Replica));
        assert!(matches!(event, AttachmentEvent::Update { .. }));
        assert!(!should_enqueue(&event));

        let event = AttachmentEvent::applied(None, deleting(Role::Primary));
        assert!(matches!(event, AttachmentEvent::Delete(_)));

        let event = AttachmentEvent::applied(None, attachment(Role::Primary));
        assert!(matches!(event, AttachmentEvent::Create(_)));
        assert_eq!(event.name(), "pv-0-node-0-attachment");
    }
}
