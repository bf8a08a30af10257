//! Garbage Collection Scheduler
//!
//! When a primary attachment is marked for deletion, the attachments of its
//! volume are cleaned up after a grace interval unless a new primary shows up
//! first. Each volume has at most one outstanding cleanup:
//!
//! ```text
//!   unscheduled ──trigger──▶ scheduled ──cancel──▶ cancelled
//!                                │
//!                                └──grace elapsed──▶ fired
//! ```

use super::attach::{cleanup_attachments, CleanupScope};
use super::metrics::ControllerMetrics;
use crate::domain::ports::ObjectStoreRef;
use crate::registry::LockRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An outstanding cleanup
#[derive(Debug)]
struct ScheduledCleanup {
    token: CancellationToken,
    generation: u64,
    handle: JoinHandle<()>,
}

/// State shared with the spawned cleanup tasks
#[derive(Clone)]
struct CleanupContext {
    store: ObjectStoreRef,
    volume_locks: Arc<LockRegistry>,
    pending: Arc<DashMap<String, ScheduledCleanup>>,
    grace_interval: Duration,
    metrics: ControllerMetrics,
}

/// Per-volume delayed cleanup with cancellation
pub struct GarbageCollector {
    context: CleanupContext,
    next_generation: AtomicU64,
}

impl GarbageCollector {
    pub fn new(
        store: ObjectStoreRef,
        volume_locks: Arc<LockRegistry>,
        grace_interval: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            context: CleanupContext {
                store,
                volume_locks,
                pending: Arc::new(DashMap::new()),
                grace_interval,
                metrics,
            },
            next_generation: AtomicU64::new(0),
        }
    }

    /// Schedule cleanup of `volume`'s attachments after the grace interval.
    ///
    /// Returns false if a cleanup is already outstanding for the volume.
    pub fn trigger(&self, volume: &str) -> bool {
        let scheduled = match self.context.pending.entry(volume.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let handle = tokio::spawn(Self::run(
                    self.context.clone(),
                    volume.to_string(),
                    token.clone(),
                    generation,
                ));
                slot.insert(ScheduledCleanup {
                    token,
                    generation,
                    handle,
                });
                true
            }
        };

        if scheduled {
            info!(
                "Scheduled cleanup of volume {} in {:?}",
                volume, self.context.grace_interval
            );
            self.context
                .metrics
                .gc_events
                .with_label_values(&["scheduled"])
                .inc();
            self.context.update_gauge();
        } else {
            debug!("Cleanup of volume {} already scheduled", volume);
        }
        scheduled
    }

    /// Cancel the outstanding cleanup of `volume`, if any
    pub fn cancel(&self, volume: &str) -> bool {
        match self.context.pending.remove(volume) {
            Some((_, cleanup)) => {
                cleanup.token.cancel();
                info!("Cancelled cleanup of volume {}", volume);
                self.context
                    .metrics
                    .gc_events
                    .with_label_values(&["cancelled"])
                    .inc();
                self.context.update_gauge();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, volume: &str) -> bool {
        self.context.pending.contains_key(volume)
    }

    pub fn pending_count(&self) -> usize {
        self.context.pending.len()
    }

    /// Cancel every outstanding cleanup
    pub fn shutdown(&self) {
        let volumes: Vec<String> = self
            .context
            .pending
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for volume in &volumes {
            self.cancel(volume);
        }
        if !volumes.is_empty() {
            info!("Cancelled {} pending cleanup(s) on shutdown", volumes.len());
        }
    }

    async fn run(
        ctx: CleanupContext,
        volume: String,
        token: CancellationToken,
        generation: u64,
    ) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(ctx.grace_interval) => {}
        }

        let guard = ctx.volume_locks.lock(&volume).await;
        if token.is_cancelled() {
            return;
        }

        match cleanup_attachments(ctx.store.as_ref(), &volume, CleanupScope::All).await {
            Ok(deleted) => info!(
                "Garbage collected volume {}: {} attachment(s) deleted",
                volume, deleted
            ),
            Err(e) => warn!("Garbage collection of volume {} failed: {}", volume, e),
        }
        ctx.metrics.gc_events.with_label_values(&["fired"]).inc();

        ctx.pending
            .remove_if(&volume, |_, cleanup| cleanup.generation == generation);
        drop(guard);
        ctx.volume_locks.remove(&volume);
        ctx.update_gauge();
    }
}

impl CleanupContext {
    fn update_gauge(&self) {
        self.metrics.gc_pending.set(self.pending.len() as i64);
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        for cleanup in self.context.pending.iter() {
            cleanup.token.cancel();
            cleanup.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::crd::{Attachment, Role};
    use prometheus::Registry;

    const GRACE: Duration = Duration::from_secs(300);

    fn setup() -> (Arc<InMemoryStore>, Arc<LockRegistry>, GarbageCollector) {
        let store = Arc::new(InMemoryStore::new("test"));
        let locks = Arc::new(LockRegistry::new());
        let metrics = ControllerMetrics::new(&Registry::new()).unwrap();
        let gc = GarbageCollector::new(store.clone(), locks.clone(), GRACE, metrics);
        (store, locks, gc)
    }

    fn seed(store: &InMemoryStore) {
        store.insert_attachment(Attachment::build("test", "pv-0", "disk-0", "node-0", Role::Primary));
        store.insert_attachment(Attachment::build("test", "pv-0", "disk-0", "node-1", Role::Replica));
        store.insert_attachment(Attachment::build("test", "pv-1", "disk-1", "node-1", Role::Replica));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_is_idempotent() {
        let (_store, _locks, gc) = setup();

        assert!(gc.trigger("pv-0"));
        assert!(!gc.trigger("pv-0"));
        assert!(gc.is_scheduled("pv-0"));
        assert_eq!(gc.pending_count(), 1);

        assert!(gc.trigger("pv-1"));
        assert_eq!(gc.pending_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_cleanup() {
        let (store, _locks, gc) = setup();
        seed(&store);

        assert!(gc.trigger("pv-0"));
        assert!(gc.cancel("pv-0"));
        assert!(!gc.cancel("pv-0"));
        assert!(!gc.is_scheduled("pv-0"));

        tokio::time::sleep(GRACE * 2).await;
        assert!(store.attachments().iter().all(|a| !a.deletion_requested()));
        assert_eq!(store.call_count("delete_attachment"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_deletes_all_attachments_and_evicts_lock() {
        let (store, locks, gc) = setup();
        seed(&store);
        let _ = locks.handle("pv-0");

        assert!(gc.trigger("pv-0"));
        tokio::time::sleep(GRACE - Duration::from_secs(1)).await;
        assert_eq!(store.call_count("delete_attachment"), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let pv0: Vec<_> = store
            .attachments()
            .into_iter()
            .filter(|a| a.spec.volume_name == "pv-0")
            .collect();
        assert_eq!(pv0.len(), 2);
        assert!(pv0.iter().all(|a| a.deletion_requested() && a.is_cleaned_up()));
        assert!(!store
            .attachment("pv-1-node-1-attachment")
            .unwrap()
            .deletion_requested());

        assert!(!locks.contains("pv-0"));
        assert!(!gc.is_scheduled("pv-0"));
        // A fresh trigger schedules again
        assert!(gc.trigger("pv-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrigger_after_cancel_fires_once() {
        let (store, _locks, gc) = setup();
        seed(&store);

        assert!(gc.trigger("pv-0"));
        tokio::time::sleep(GRACE / 2).await;
        assert!(gc.cancel("pv-0"));
        assert!(gc.trigger("pv-0"));

        // The cancelled task's deadline passes without effect
        tokio::time::sleep(GRACE / 2 + Duration::from_secs(1)).await;
        assert_eq!(store.call_count("delete_attachment"), 0);
        assert!(gc.is_scheduled("pv-0"));

        tokio::time::sleep(GRACE / 2).await;
        assert_eq!(store.call_count("delete_attachment"), 2);
        assert!(!gc.is_scheduled("pv-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let (store, _locks, gc) = setup();
        seed(&store);

        gc.trigger("pv-0");
        gc.trigger("pv-1");
        gc.shutdown();
        assert_eq!(gc.pending_count(), 0);

        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(store.call_count("delete_attachment"), 0);
    }
}
