//! Custom Resource Definitions for the Replicated Volume Operator
//!
//! This module contains all CRD types:
//! - Volume: a cloud-backed disk and its provisioning result
//! - Attachment: a Volume bound to a node as primary or replica

pub mod attachment;
pub mod volume;

pub use attachment::*;
pub use volume::*;

/// Name of the CSI driver whose volumes this operator manages
pub const DRIVER_NAME: &str = "disk.csi.billyronks.io";

/// Storage class parameter holding the desired replica count
pub const MAX_MOUNT_REPLICA_COUNT_PARAM: &str = "maxMountReplicaCount";
