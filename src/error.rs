//! Error types for the Replicated Volume Operator
//!
//! Provides structured error types for the reconcilers, the object store and
//! provisioner adapters, and the replica controller.

use std::time::Duration;
use thiserror::Error;

/// Kind of cluster object an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Volume,
    Attachment,
    PersistentVolume,
    StorageClass,
    Pod,
    Node,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Volume => write!(f, "Volume"),
            ResourceKind::Attachment => write!(f, "Attachment"),
            ResourceKind::PersistentVolume => write!(f, "PersistentVolume"),
            ResourceKind::StorageClass => write!(f, "StorageClass"),
            ResourceKind::Pod => write!(f, "Pod"),
            ResourceKind::Node => write!(f, "Node"),
        }
    }
}

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Object Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: ResourceKind, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: ResourceKind, name: String },

    #[error("Conflicting update of {kind}/{name}: object has been modified")]
    Conflict { kind: ResourceKind, name: String },

    #[error("Invalid object {kind}/{name}: {reason}")]
    InvalidObject {
        kind: ResourceKind,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Replica management for volume {volume} gave up after {attempts} attempts")]
    ReplicaRetriesExhausted { volume: String, attempts: u32 },

    #[error("Failed to create replica attachment for volume {volume} on node {node}: {reason}")]
    ReplicaCreationFailed {
        volume: String,
        node: String,
        reason: String,
    },

    #[error("Recovery failed for persistent volume(s): {}", .failed.join(", "))]
    RecoveryIncomplete { failed: Vec<String> },

    // =========================================================================
    // Provisioner Errors
    // =========================================================================
    #[error("Provisioning operation {operation} failed for {volume}: {reason}")]
    ProvisioningFailed {
        operation: String,
        volume: String,
        reason: String,
    },

    #[error("Cloud volume not found: {volume_id}")]
    CloudVolumeNotFound { volume_id: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Shorthand for a precondition failure
    pub fn aborted(message: impl Into<String>) -> Self {
        Error::Aborted(message.into())
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Conflict { .. }
            | Error::ProvisioningFailed { .. }
            | Error::ReplicaCreationFailed { .. } => ErrorAction::RequeueWithBackoff,

            // Preconditions not met yet - wait for the world to catch up
            Error::Aborted(_) => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Object vanished while we worked on it - the next event decides
            Error::ResourceNotFound { .. } => ErrorAction::NoRequeue,

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::InvalidObject { .. }
            | Error::CapacityParse(_)
            | Error::ReplicaRetriesExhausted { .. }
            | Error::RecoveryIncomplete { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Whether the reconcile that produced this error should be requeued
    pub fn requeue(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Conflict { .. } | Error::ProvisioningFailed { .. }
        )
    }

    /// Check if the object the operation targeted is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    /// Check if the object the operation tried to create already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(response)) => {
                response.code == 409 && response.reason == "AlreadyExists"
            }
            _ => false,
        }
    }

    /// Check if this is a precondition failure
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::aborted("volume deletion requeued until attachments are detached");
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(5))
        );
        assert!(err.requeue());

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Conflict {
            kind: ResourceKind::Volume,
            name: "pv-1".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_classification() {
        let transient = Error::ProvisioningFailed {
            operation: "create".into(),
            volume: "pv-1".into(),
            reason: "throttled".into(),
        };
        assert!(transient.requeue());
        assert!(transient.is_transient());

        let missing = Error::ResourceNotFound {
            kind: ResourceKind::Attachment,
            name: "pv-1-node-0-attachment".into(),
        };
        assert!(missing.is_not_found());
        assert!(!missing.requeue());

        let exists = Error::ResourceExists {
            kind: ResourceKind::Attachment,
            name: "pv-1-node-0-attachment".into(),
        };
        assert!(exists.is_already_exists());
        assert!(!exists.is_not_found());
    }

    #[test]
    fn test_resource_kind_display() {
        assert_eq!(
            format!(
                "{}",
                Error::ResourceNotFound {
                    kind: ResourceKind::Volume,
                    name: "pv-0".into()
                }
            ),
            "Resource not found: Volume/pv-0"
        );
    }

    #[test]
    fn test_recovery_incomplete_lists_volumes() {
        let err = Error::RecoveryIncomplete {
            failed: vec!["pv-1".into(), "pv-4".into()],
        };
        assert_eq!(
            err.to_string(),
            "Recovery failed for persistent volume(s): pv-1, pv-4"
        );
        assert!(!err.requeue());
    }
}
