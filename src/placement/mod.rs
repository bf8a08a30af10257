//! Placement Module
//!
//! Orders candidate nodes for new replica attachments according to a
//! placement policy and the scheduling constraints of the volume's pods.

pub mod policy;
pub mod selector;

pub use policy::*;
pub use selector::*;
