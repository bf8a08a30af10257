//! Replicated Volume Operator
//!
//! A Kubernetes operator managing cloud-backed block volumes and their mount
//! attachments: one primary attachment per volume, kept company by a
//! configurable number of standby replicas on other nodes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Controller Runtime                              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │     Volume      │  │   Attachment    │  │    Pod / Node / PV          │  │
//! │  │   Reconciler    │  │   Reconciler    │  │    Watches                  │  │
//! │  └────────┬────────┘  └───┬─────────┬───┘  └─────────────┬───────────────┘  │
//! │           │               │         │                    │                   │
//! │           │     ┌─────────┴───┐ ┌───┴─────────────┐      │                   │
//! │           │     │   Garbage   │ │    Replica      │      │                   │
//! │           │     │  Collector  │ │    Manager      │      │                   │
//! │           │     └─────────────┘ └───────┬─────────┘      │                   │
//! │           │                             │                │                   │
//! │  ┌────────┴─────────────────────────────┴────────────────┴───────────────┐  │
//! │  │        Lock Registry  ·  Relationship Index  ·  Node Inventory        │  │
//! │  └───────────────────────────────────────────────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                                Adapters                                      │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │   Object Store              │  │   Volume Provisioner                │   │
//! │  │   (Kubernetes / in-memory)  │  │   (cloud disks / in-memory)         │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Reconcilers, replica manager, garbage collector, runtime
//! - [`registry`]: Keyed locks, pod/claim/volume index, node inventory
//! - [`placement`]: Replica node selection
//! - [`backends`]: Object store and provisioner adapters
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Port traits
//! - [`error`]: Error types and handling

pub mod backends;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod placement;
pub mod registry;

// Re-export commonly used types
pub use backends::{InMemoryProvisioner, InMemoryStore, KubeStore, StoreEvent};

pub use controller::{
    AttachmentReconciler, ControllerMetrics, EventSource, GarbageCollector, GcConfig, Operator,
    OperatorConfig, ReplicaConfig, ReplicaManager, VolumeReconciler,
};

pub use crd::{
    Attachment, AttachmentSpec, AttachmentState, AttachmentStatus, Role, Volume, VolumeDetail,
    VolumePhase, VolumeSpec, VolumeState, VolumeStatus,
};

pub use domain::ports::{ObjectStore, ObjectStoreRef, VolumeProvisioner, VolumeProvisionerRef};

pub use error::{Error, ErrorAction, Result};

pub use placement::{NodeSelector, PlacementPolicy};

pub use registry::{LockRegistry, NodeInfo, NodeInventory, RelationshipIndex};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
