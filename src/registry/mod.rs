//! Process-local Registries
//!
//! Shared state derived from watches and used to serialize work:
//! - Lock registry: keyed async mutexes for volumes and pods
//! - Relationship index: pod, claim and volume associations
//! - Node inventory: schedulable nodes for replica placement

pub mod index;
pub mod locks;
pub mod nodes;

pub use index::{object_key, PodPlacement, RelationshipIndex};
pub use locks::LockRegistry;
pub use nodes::{NodeInfo, NodeInventory, ZONE_LABEL};
