//! Domain layer - Port definitions
//!
//! This module defines the traits (ports) that the object store and
//! provisioner adapters implement, following hexagonal architecture
//! principles.

pub mod ports;

pub use ports::*;
