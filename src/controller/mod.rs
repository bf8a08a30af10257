//! Controllers
//!
//! Reconciliation logic for Volumes and Attachments:
//! - Volume reconciler: provisioning, expansion, deletion and recovery
//! - Attachment reconciler: attach, promote, demote and detach
//! - Replica manager: keeps the configured number of standby replicas
//! - Garbage collector: delayed cleanup after a primary goes away
//! - Runtime: watches, work queues and the assembled operator

pub mod attach;
pub mod attachment;
pub mod config;
pub mod events;
pub mod gc;
pub mod metrics;
pub mod replica;
pub mod runtime;
pub mod volume;

pub use attach::{cleanup_attachments, CleanupScope};
pub use attachment::AttachmentReconciler;
pub use config::{GcConfig, OperatorConfig, ReplicaConfig};
pub use events::{should_enqueue, AttachmentEvent};
pub use gc::GarbageCollector;
pub use metrics::ControllerMetrics;
pub use replica::ReplicaManager;
pub use runtime::{requeue_delay, EventSource, Operator};
pub use volume::{parse_quantity, VolumeReconciler};
