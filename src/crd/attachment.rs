//! Attachment CRD
//!
//! Binds one Volume to one node in either the primary (mounted) or replica
//! (standby, pre-attached for fast failover) role.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the volume name
pub const VOLUME_NAME_LABEL: &str = "storage.billyronks.io/volume-name";
/// Label carrying the node name
pub const NODE_NAME_LABEL: &str = "storage.billyronks.io/node-name";
/// Label carrying the requested role
pub const ROLE_LABEL: &str = "storage.billyronks.io/role";
/// Set on attachments deleted by a cleanup path; no replacement is created for them
pub const CLEAN_UP_ANNOTATION: &str = "storage.billyronks.io/clean-up";
/// Finalizer that keeps an Attachment until the disk is detached from its node
pub const ATTACHMENT_FINALIZER: &str = "storage.billyronks.io/attachment-finalizer";

// =============================================================================
// Attachment CRD
// =============================================================================

/// Attachment of a Volume to a node. The object name is derived from the
/// (volume, node) pair so a pair can only ever be attached once.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "Attachment",
    plural = "attachments",
    shortname = "batt",
    status = "AttachmentStatus",
    namespaced,
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Requested", "type": "string", "jsonPath": ".spec.role"}"#,
    printcolumn = r#"{"name": "Role", "type": "string", "jsonPath": ".status.detail.role"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentSpec {
    /// Name of the Volume object
    pub volume_name: String,

    /// Cloud identifier of the disk
    pub volume_id: String,

    /// Node the disk is attached to
    pub node_name: String,

    /// Requested role
    pub role: Role,

    /// Volume context passed to publish
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

/// Role of an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Role {
    Primary,
    Replica,
}

impl Role {
    /// Label value for this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "Primary",
            Role::Replica => "Replica",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the Attachment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentStatus {
    /// Attachment state
    #[serde(default)]
    pub state: AttachmentState,

    /// Observed result of the last publish
    #[serde(default)]
    pub detail: Option<AttachmentDetail>,
}

/// Attachment state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AttachmentState {
    #[default]
    Pending,
    Attaching,
    Attached,
    AttachmentFailed,
    Detaching,
    Detached,
    DetachmentFailed,
}

/// Observed attachment detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDetail {
    /// Role the node currently serves
    pub role: Role,

    /// Context returned by publish
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
}

// =============================================================================
// Implementations
// =============================================================================

/// Deterministic object name for the (volume, node) pair.
///
/// The parts are joined with dashes and lowercased, so distinct pairs can map
/// to the same name when dashes or case differ at the seam, e.g.
/// (`a-b`, `c`) and (`a`, `b-c`). Callers assume the volumes and nodes they
/// pair never collide this way; if they do, the second create fails with
/// AlreadyExists and that pair is skipped.
pub fn attachment_name(volume_name: &str, node_name: &str) -> String {
    format!("{}-{}-attachment", volume_name, node_name).to_lowercase()
}

impl Attachment {
    /// Build a labelled Attachment object for the (volume, node) pair
    pub fn build(
        namespace: &str,
        volume_name: &str,
        volume_id: &str,
        node_name: &str,
        role: Role,
    ) -> Self {
        let volume_name = volume_name.to_lowercase();
        let node_name = node_name.to_lowercase();
        let mut attachment = Attachment::new(
            &attachment_name(&volume_name, &node_name),
            AttachmentSpec {
                volume_name: volume_name.clone(),
                volume_id: volume_id.to_string(),
                node_name: node_name.clone(),
                role,
                volume_context: BTreeMap::new(),
            },
        );
        attachment.metadata.namespace = Some(namespace.to_string());
        attachment.metadata.labels = Some(BTreeMap::from([
            (VOLUME_NAME_LABEL.to_string(), volume_name),
            (NODE_NAME_LABEL.to_string(), node_name),
            (ROLE_LABEL.to_string(), role.as_str().to_string()),
        ]));
        attachment.metadata.finalizers = Some(vec![ATTACHMENT_FINALIZER.to_string()]);
        attachment
    }

    /// Request a role, keeping the role label in step with the spec
    pub fn set_requested_role(&mut self, role: Role) {
        self.spec.role = role;
        self.labels_mut()
            .insert(ROLE_LABEL.to_string(), role.as_str().to_string());
    }

    /// Whether the detach finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == ATTACHMENT_FINALIZER)
    }

    /// Whether deletion of this object has been requested
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the node reports the disk as attached
    pub fn is_attached(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.state == AttachmentState::Attached && s.detail.is_some())
            .unwrap_or(false)
    }

    /// Role the node currently serves, if any
    pub fn observed_role(&self) -> Option<Role> {
        self.status
            .as_ref()
            .and_then(|s| s.detail.as_ref())
            .map(|d| d.role)
    }

    /// Whether a cleanup path already handled this attachment
    pub fn is_cleaned_up(&self) -> bool {
        self.annotations().contains_key(CLEAN_UP_ANNOTATION)
    }
}
