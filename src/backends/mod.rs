//! Object Store and Provisioner Adapters
//!
//! Provides adapters for the domain ports:
//! - KubeStore: cluster objects through the Kubernetes API
//! - InMemoryStore: process-local objects for tests and standalone mode
//! - InMemoryProvisioner: process-local disks

pub mod kube_store;
pub mod memory_provisioner;
pub mod memory_store;

pub use kube_store::*;
pub use memory_provisioner::*;
pub use memory_store::*;
