//! Controller Runtime
//!
//! Wires the reconcilers to their event sources:
//!
//! - Volumes: kube-rs `Controller` (one in-flight reconcile per object)
//! - Attachments: a filtered watch feeding a work queue, reconciled with
//!   bounded concurrency and at most one in-flight reconcile per name
//! - Pods, Nodes, PersistentVolumes: watches keeping the relationship index,
//!   node inventory and volume phases current
//!
//! In standalone mode the in-memory store's change stream stands in for the
//! watches.

use super::attachment::AttachmentReconciler;
use super::config::OperatorConfig;
use super::events::{should_enqueue, AttachmentEvent};
use super::gc::GarbageCollector;
use super::metrics::ControllerMetrics;
use super::replica::ReplicaManager;
use super::volume::VolumeReconciler;
use crate::backends::{InMemoryStore, StoreEvent};
use crate::crd::{Attachment, Volume, VolumePhase};
use crate::domain::ports::{ObjectStoreRef, VolumeProvisionerRef};
use crate::error::{Error, ErrorAction, Result};
use crate::placement::NodeSelector;
use crate::registry::{object_key, LockRegistry, NodeInfo, NodeInventory, RelationshipIndex};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::channel::mpsc;
use futures::{Future, StreamExt};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, Pod};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use prometheus::Registry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First retry delay for transient failures
const REQUEUE_BASE: Duration = Duration::from_secs(1);

/// Longest retry delay for transient failures
const REQUEUE_MAX: Duration = Duration::from_secs(300);

/// Delay before retrying a failed reconcile, or `None` to wait for the next
/// change. `failures` counts consecutive failures including this one.
pub fn requeue_delay(error: &Error, failures: u32) -> Option<Duration> {
    match error.action() {
        ErrorAction::RequeueAfter(delay) => Some(delay),
        ErrorAction::RequeueWithBackoff => {
            let exponent = failures.saturating_sub(1).min(16);
            Some((REQUEUE_BASE * 2u32.pow(exponent)).min(REQUEUE_MAX))
        }
        ErrorAction::NoRequeue => None,
    }
}

// =============================================================================
// Operator
// =============================================================================

/// Where the operator receives change notifications from
pub enum EventSource {
    /// Watches against a Kubernetes API server
    Kubernetes(Client),
    /// The change stream of an in-memory store
    InMemory(Arc<InMemoryStore>),
}

/// The assembled controllers and their shared state
pub struct Operator {
    config: OperatorConfig,
    index: Arc<RelationshipIndex>,
    inventory: Arc<NodeInventory>,
    gc: Arc<GarbageCollector>,
    replicas: Arc<ReplicaManager>,
    volumes: Arc<VolumeReconciler>,
    attachments: Arc<AttachmentReconciler>,
    metrics: ControllerMetrics,
}

impl Operator {
    /// Assemble the controllers, registering their metrics with `registry`
    pub fn new(
        config: OperatorConfig,
        store: ObjectStoreRef,
        provisioner: VolumeProvisionerRef,
        inventory: Arc<NodeInventory>,
        registry: &Registry,
    ) -> Result<Self> {
        let metrics = ControllerMetrics::new(registry)?;
        let index = Arc::new(RelationshipIndex::new());
        let volume_locks = Arc::new(LockRegistry::new());

        let gc = Arc::new(GarbageCollector::new(
            store.clone(),
            volume_locks.clone(),
            config.gc.grace_interval,
            metrics.clone(),
        ));
        let selector = NodeSelector::new(
            inventory.clone(),
            index.clone(),
            config.replica.placement_policy,
        );
        let replicas = Arc::new(ReplicaManager::new(
            config.namespace.clone(),
            store.clone(),
            provisioner.clone(),
            volume_locks.clone(),
            index.clone(),
            selector,
            gc.clone(),
            config.replica.clone(),
            metrics.clone(),
        ));
        let volumes = Arc::new(VolumeReconciler::new(
            config.namespace.clone(),
            config.driver_name.clone(),
            store.clone(),
            provisioner.clone(),
            index.clone(),
            volume_locks,
        ));
        let attachments = Arc::new(AttachmentReconciler::new(
            store,
            provisioner,
            gc.clone(),
            replicas.clone(),
        ));

        Ok(Self {
            config,
            index,
            inventory,
            gc,
            replicas,
            volumes,
            attachments,
            metrics,
        })
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn replicas(&self) -> &Arc<ReplicaManager> {
        &self.replicas
    }

    /// Run until `shutdown` is cancelled or an event source ends.
    ///
    /// Fails before starting the controllers if startup recovery could not
    /// rebuild every Volume.
    pub async fn run(&self, source: EventSource, shutdown: CancellationToken) -> Result<()> {
        if self.config.recover_on_start {
            let count = self.volumes.recover().await?;
            info!("Recovery created {} volume(s)", count);
        }

        let result = match source {
            EventSource::Kubernetes(client) => self.run_kubernetes(client, &shutdown).await,
            EventSource::InMemory(store) => self.run_in_memory(store, &shutdown).await,
        };

        self.gc.shutdown();
        info!("Controllers stopped");
        result
    }

    // =========================================================================
    // Kubernetes
    // =========================================================================

    async fn run_kubernetes(&self, client: Client, shutdown: &CancellationToken) -> Result<()> {
        let namespace = self.config.namespace.as_str();
        info!(
            "Starting controllers in namespace {} (concurrency {})",
            namespace, self.config.concurrency
        );

        let context = Arc::new(VolumeContext {
            reconciler: self.volumes.clone(),
            metrics: self.metrics.clone(),
            failures: DashMap::new(),
            slots: Semaphore::new(self.config.concurrency.max(1)),
        });
        let volume_controller = Controller::new(
            Api::<Volume>::namespaced(client.clone(), namespace),
            watcher::Config::default(),
        )
        .run(reconcile_volume, volume_error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((volume, _)) => debug!("Reconciled volume {}", volume.name),
                Err(e) => debug!("Volume controller event: {}", e),
            }
        });

        let (sender, receiver) = mpsc::unbounded();
        let dispatcher = Dispatcher::new("attachment", sender.clone(), self.metrics.clone());
        let attachments = self.attachments.clone();
        let dispatch = dispatcher.run(receiver, self.config.concurrency, move |name| {
            let attachments = attachments.clone();
            async move { attachments.reconcile(&name).await }
        });

        tokio::select! {
            _ = shutdown.cancelled() => info!("Shutdown requested"),
            _ = volume_controller => warn!("Volume controller stream ended"),
            _ = dispatch => warn!("Attachment dispatcher ended"),
            _ = watch_attachments(Api::namespaced(client.clone(), namespace), sender) => {
                warn!("Attachment watch ended")
            }
            _ = watch_pods(Api::all(client.clone()), self.index.clone()) => {
                warn!("Pod watch ended")
            }
            _ = watch_nodes(Api::all(client.clone()), self.inventory.clone()) => {
                warn!("Node watch ended")
            }
            _ = watch_persistent_volumes(
                Api::all(client),
                self.config.driver_name.clone(),
                self.index.clone(),
                self.volumes.clone(),
            ) => warn!("PersistentVolume watch ended"),
        }
        Ok(())
    }

    // =========================================================================
    // In-Memory
    // =========================================================================

    async fn run_in_memory(
        &self,
        store: Arc<InMemoryStore>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        info!("Starting controllers against the in-memory store");
        let mut events = store.subscribe();

        let (volume_tx, volume_rx) = mpsc::unbounded();
        let (attachment_tx, attachment_rx) = mpsc::unbounded();

        let volume_dispatcher = Dispatcher::new("volume", volume_tx.clone(), self.metrics.clone());
        let volumes = self.volumes.clone();
        let volume_dispatch = volume_dispatcher.run(volume_rx, self.config.concurrency, move |name| {
            let volumes = volumes.clone();
            async move { volumes.reconcile(&name).await }
        });

        let attachment_dispatcher =
            Dispatcher::new("attachment", attachment_tx.clone(), self.metrics.clone());
        let attachments = self.attachments.clone();
        let attachment_dispatch =
            attachment_dispatcher.run(attachment_rx, self.config.concurrency, move |name| {
                let attachments = attachments.clone();
                async move { attachments.reconcile(&name).await }
            });

        let pump = async {
            resync(&store, &volume_tx, &attachment_tx);
            loop {
                match events.recv().await {
                    Ok(StoreEvent::VolumeApplied(name)) => {
                        let _ = volume_tx.unbounded_send(name);
                    }
                    Ok(StoreEvent::VolumeRemoved(name)) => debug!("Volume {} removed", name),
                    Ok(StoreEvent::Attachment(event)) => enqueue_attachment(&attachment_tx, event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} store events, resyncing", missed);
                        resync(&store, &volume_tx, &attachment_tx);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => info!("Shutdown requested"),
            _ = pump => warn!("Store event stream closed"),
            _ = volume_dispatch => warn!("Volume dispatcher ended"),
            _ = attachment_dispatch => warn!("Attachment dispatcher ended"),
        }
        Ok(())
    }
}

/// Queue every stored object as if it had just been observed
fn resync(
    store: &InMemoryStore,
    volumes: &mpsc::UnboundedSender<String>,
    attachments: &mpsc::UnboundedSender<String>,
) {
    for name in store.volume_names() {
        let _ = volumes.unbounded_send(name);
    }
    for attachment in store.attachments() {
        enqueue_attachment(attachments, AttachmentEvent::applied(None, attachment));
    }
}

// =============================================================================
// Volume Controller
// =============================================================================

/// Shared state of the volume `Controller`
struct VolumeContext {
    reconciler: Arc<VolumeReconciler>,
    metrics: ControllerMetrics,
    failures: DashMap<String, u32>,
    slots: Semaphore,
}

async fn reconcile_volume(volume: Arc<Volume>, ctx: Arc<VolumeContext>) -> Result<Action> {
    let _slot = ctx
        .slots
        .acquire()
        .await
        .map_err(|e| Error::Internal(format!("reconcile slots closed: {}", e)))?;

    let name = volume.name_any();
    let start = Instant::now();
    let result = ctx.reconciler.reconcile(&name).await;
    ctx.metrics
        .observe_reconcile("volume", result.is_ok(), start.elapsed().as_secs_f64());

    result?;
    ctx.failures.remove(&name);
    Ok(Action::await_change())
}

fn volume_error_policy(volume: Arc<Volume>, error: &Error, ctx: Arc<VolumeContext>) -> Action {
    let name = volume.name_any();
    let failures = {
        let mut count = ctx.failures.entry(name.clone()).or_insert(0);
        *count += 1;
        *count
    };

    match requeue_delay(error, failures) {
        Some(delay) => {
            warn!(
                "Reconcile of volume {} failed ({} in a row), retrying in {:?}: {}",
                name, failures, delay, error
            );
            Action::requeue(delay)
        }
        None => {
            error!("Reconcile of volume {} failed: {}", name, error);
            Action::await_change()
        }
    }
}

// =============================================================================
// Work Queue
// =============================================================================

/// Pass an attachment event through the filter onto the queue
fn enqueue_attachment(queue: &mpsc::UnboundedSender<String>, event: AttachmentEvent) {
    if !should_enqueue(&event) {
        return;
    }
    let name = event.name();
    debug!("Queueing attachment {} ({:?})", name, EventKind::of(&event));
    let _ = queue.unbounded_send(name);
}

#[derive(Debug)]
enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    fn of(event: &AttachmentEvent) -> Self {
        match event {
            AttachmentEvent::Create(_) => EventKind::Create,
            AttachmentEvent::Update { .. } => EventKind::Update,
            AttachmentEvent::Delete(_) => EventKind::Delete,
        }
    }
}

/// Reconciles queued names with bounded concurrency.
///
/// A name occupies at most one slot. Copies of a name that arrive while it
/// is in flight collapse into a single follow-up run, so a burst of events
/// for one object never holds back the others. Failed names are queued
/// again after their requeue delay.
struct Dispatcher {
    kind: &'static str,
    /// Names admitted and not yet finished, flagged when another run is due
    active: DashMap<String, bool>,
    failures: DashMap<String, u32>,
    requeue: mpsc::UnboundedSender<String>,
    metrics: ControllerMetrics,
}

impl Dispatcher {
    fn new(
        kind: &'static str,
        requeue: mpsc::UnboundedSender<String>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            kind,
            active: DashMap::new(),
            failures: DashMap::new(),
            requeue,
            metrics,
        }
    }

    async fn run<F, Fut>(
        self,
        receiver: mpsc::UnboundedReceiver<String>,
        concurrency: usize,
        reconcile: F,
    ) where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let this = &self;
        let reconcile = &reconcile;
        receiver
            .filter(move |name| futures::future::ready(this.admit(name)))
            .for_each_concurrent(concurrency.max(1), move |name| async move {
                this.process(name, reconcile).await
            })
            .await;
    }

    /// Whether `name` should take a slot. A name already in flight is only
    /// flagged to run once more.
    fn admit(&self, name: &str) -> bool {
        match self.active.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(true);
                debug!("{} {} already in flight, coalescing", self.kind, name);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(false);
                true
            }
        }
    }

    /// Release `name`, or claim its pending follow-up run
    fn finish(&self, name: &str) -> bool {
        let Entry::Occupied(mut entry) = self.active.entry(name.to_string()) else {
            return false;
        };
        if *entry.get() {
            entry.insert(false);
            true
        } else {
            entry.remove();
            false
        }
    }

    async fn process<F, Fut>(&self, name: String, reconcile: &F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            let start = Instant::now();
            let result = reconcile(name.clone()).await;
            self.metrics
                .observe_reconcile(self.kind, result.is_ok(), start.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    self.failures.remove(&name);
                }
                Err(e) => self.schedule_retry(&name, &e),
            }

            if !self.finish(&name) {
                return;
            }
        }
    }

    fn schedule_retry(&self, name: &str, error: &Error) {
        let failures = {
            let mut count = self.failures.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        let Some(delay) = requeue_delay(error, failures) else {
            error!("Reconcile of {} {} failed: {}", self.kind, name, error);
            return;
        };
        warn!(
            "Reconcile of {} {} failed ({} in a row), retrying in {:?}: {}",
            self.kind, name, failures, delay, error
        );

        let requeue = self.requeue.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = requeue.unbounded_send(name);
        });
    }
}

// =============================================================================
// Watches
// =============================================================================

/// Watch Attachments, deriving create/update/delete events from a cache of
/// the last observed objects
async fn watch_attachments(api: Api<Attachment>, queue: mpsc::UnboundedSender<String>) {
    let mut cache: HashMap<String, Attachment> = HashMap::new();
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(attachment)) => {
                let old = cache.insert(attachment.name_any(), attachment.clone());
                enqueue_attachment(&queue, AttachmentEvent::applied(old, attachment));
            }
            Ok(watcher::Event::Deleted(attachment)) => {
                cache.remove(&attachment.name_any());
                enqueue_attachment(&queue, AttachmentEvent::removed(attachment));
            }
            Ok(watcher::Event::Restarted(attachments)) => {
                let mut fresh = HashMap::with_capacity(attachments.len());
                for attachment in attachments {
                    let name = attachment.name_any();
                    let old = cache.remove(&name);
                    fresh.insert(name, attachment.clone());
                    enqueue_attachment(&queue, AttachmentEvent::applied(old, attachment));
                }
                for (_, gone) in cache.drain() {
                    enqueue_attachment(&queue, AttachmentEvent::removed(gone));
                }
                cache = fresh;
            }
            Err(e) => warn!("Attachment watch error: {}", e),
        }
    }
}

/// Keep the relationship index in step with Pods
async fn watch_pods(api: Api<Pod>, index: Arc<RelationshipIndex>) {
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(pod)) => {
                if pod_finished(&pod) {
                    index.remove_pod(&pod_key(&pod)).await;
                } else {
                    index.add_pod(&pod);
                }
            }
            Ok(watcher::Event::Deleted(pod)) => index.remove_pod(&pod_key(&pod)).await,
            Ok(watcher::Event::Restarted(pods)) => {
                for pod in pods.iter().filter(|p| !pod_finished(p)) {
                    index.add_pod(pod);
                }
                debug!("Indexed {} pod(s)", index.pod_count());
            }
            Err(e) => warn!("Pod watch error: {}", e),
        }
    }
}

fn pod_key(pod: &Pod) -> String {
    object_key(&pod.namespace().unwrap_or_default(), &pod.name_any())
}

fn pod_finished(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
        || pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|phase| phase == "Succeeded" || phase == "Failed")
            .unwrap_or(false)
}

/// Keep the node inventory in step with Nodes
async fn watch_nodes(api: Api<Node>, inventory: Arc<NodeInventory>) {
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(node)) => inventory.upsert(NodeInfo::from(&node)),
            Ok(watcher::Event::Deleted(node)) => {
                inventory.remove(&node.name_any());
            }
            Ok(watcher::Event::Restarted(nodes)) => {
                inventory.replace_all(nodes.iter().map(NodeInfo::from));
                info!("Node inventory holds {} node(s)", inventory.len());
            }
            Err(e) => warn!("Node watch error: {}", e),
        }
    }
}

/// Register claims of this driver's PersistentVolumes and mirror their
/// phase onto the matching Volumes
async fn watch_persistent_volumes(
    api: Api<PersistentVolume>,
    driver_name: String,
    index: Arc<RelationshipIndex>,
    volumes: Arc<VolumeReconciler>,
) {
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(pv)) => {
                observe_persistent_volume(&pv, &driver_name, &index, &volumes).await
            }
            Ok(watcher::Event::Deleted(pv)) => {
                if is_driver_volume(&pv, &driver_name) {
                    index.remove_volume(&pv.name_any());
                }
            }
            Ok(watcher::Event::Restarted(pvs)) => {
                for pv in &pvs {
                    observe_persistent_volume(pv, &driver_name, &index, &volumes).await;
                }
            }
            Err(e) => warn!("PersistentVolume watch error: {}", e),
        }
    }
}

fn is_driver_volume(pv: &PersistentVolume, driver_name: &str) -> bool {
    pv.spec
        .as_ref()
        .and_then(|s| s.csi.as_ref())
        .map(|csi| csi.driver == driver_name)
        .unwrap_or(false)
}

async fn observe_persistent_volume(
    pv: &PersistentVolume,
    driver_name: &str,
    index: &RelationshipIndex,
    volumes: &VolumeReconciler,
) {
    if !is_driver_volume(pv, driver_name) {
        return;
    }
    let name = pv.name_any();

    let claim = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref());
    if let Some((namespace, claim_name)) =
        claim.and_then(|c| Some((c.namespace.as_ref()?, c.name.as_ref()?)))
    {
        index.add_volume(&name, &object_key(namespace, claim_name));
    }

    let phase = pv
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .and_then(VolumePhase::from_pv_phase);
    if let Some(phase) = phase {
        if let Err(e) = volumes.update_phase(&name, phase).await {
            warn!("Failed to record phase of volume {}: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryProvisioner;
    use crate::crd::{CapacityRange, Role, VolumeSpec, VolumeState};
    use crate::domain::ports::ObjectStore;
    use crate::error::ResourceKind;
    use crate::placement::PlacementPolicy;
    use std::collections::BTreeMap;

    #[test]
    fn test_requeue_delay() {
        let aborted = Error::aborted("waiting");
        assert_eq!(requeue_delay(&aborted, 7), Some(Duration::from_secs(5)));

        let conflict = Error::Conflict {
            kind: ResourceKind::Volume,
            name: "pv-0".into(),
        };
        assert_eq!(requeue_delay(&conflict, 1), Some(Duration::from_secs(1)));
        assert_eq!(requeue_delay(&conflict, 4), Some(Duration::from_secs(8)));
        assert_eq!(requeue_delay(&conflict, 40), Some(REQUEUE_MAX));

        let config = Error::Configuration("bad".into());
        assert_eq!(requeue_delay(&config, 1), None);
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn call_count(calls: &DashMap<String, usize>, name: &str) -> usize {
        calls.get(name).map(|c| *c).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_dispatcher_coalesces_repeated_name() {
        let (sender, receiver) = mpsc::unbounded();
        let metrics = ControllerMetrics::new(&Registry::new()).unwrap();
        let dispatcher = Dispatcher::new("attachment", sender.clone(), metrics);

        let calls: Arc<DashMap<String, usize>> = Arc::new(DashMap::new());
        let gate = Arc::new(Semaphore::new(0));
        let running = {
            let calls = calls.clone();
            let gate = gate.clone();
            tokio::spawn(dispatcher.run(receiver, 2, move |name: String| {
                let calls = calls.clone();
                let gate = gate.clone();
                async move {
                    *calls.entry(name.clone()).or_insert(0) += 1;
                    if name == "pv-0-node-0-attachment" {
                        let _permit = gate
                            .acquire()
                            .await
                            .map_err(|e| Error::Internal(e.to_string()))?;
                    }
                    Ok(())
                }
            }))
        };

        for _ in 0..10 {
            sender
                .unbounded_send("pv-0-node-0-attachment".to_string())
                .unwrap();
        }
        sender
            .unbounded_send("pv-1-node-0-attachment".to_string())
            .unwrap();

        // The flood takes one slot; the other name still gets through
        eventually("second name reconciled", || {
            call_count(&calls, "pv-1-node-0-attachment") == 1
        })
        .await;
        assert_eq!(call_count(&calls, "pv-0-node-0-attachment"), 1);

        // The queued copies collapse into a single follow-up run
        gate.add_permits(10);
        eventually("follow-up run", || {
            call_count(&calls, "pv-0-node-0-attachment") == 2
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call_count(&calls, "pv-0-node-0-attachment"), 2);

        // Once idle the name is admitted again
        sender
            .unbounded_send("pv-0-node-0-attachment".to_string())
            .unwrap();
        eventually("later event reconciled", || {
            call_count(&calls, "pv-0-node-0-attachment") == 3
        })
        .await;

        running.abort();
    }

    fn start() -> (Arc<InMemoryStore>, Arc<Operator>, CancellationToken) {
        let store = Arc::new(InMemoryStore::new("test"));
        let inventory = Arc::new(NodeInventory::new());
        for i in 0..3 {
            inventory.upsert(NodeInfo::new(format!("node-{}", i)));
        }

        let mut config = OperatorConfig {
            namespace: "test".into(),
            ..Default::default()
        };
        config.replica.deletion_poll_interval = Duration::from_millis(20);
        config.replica.placement_policy = PlacementPolicy::Lexical;

        let operator = Arc::new(
            Operator::new(
                config,
                store.clone(),
                Arc::new(InMemoryProvisioner::new()),
                inventory,
                &Registry::new(),
            )
            .unwrap(),
        );

        let shutdown = CancellationToken::new();
        {
            let operator = operator.clone();
            let store = store.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                operator
                    .run(EventSource::InMemory(store), shutdown)
                    .await
            });
        }
        (store, operator, shutdown)
    }

    fn replicas(store: &InMemoryStore) -> Vec<Attachment> {
        store
            .attachments()
            .into_iter()
            .filter(|a| a.spec.role == Role::Replica && !a.deletion_requested())
            .collect()
    }

    #[tokio::test]
    async fn test_standalone_volume_and_attachment_flow() {
        let (store, operator, shutdown) = start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        store
            .create_volume(&Volume::build(
                "pv-0",
                "test",
                VolumeSpec {
                    volume_name: "pv-0".into(),
                    capacity_range: CapacityRange {
                        required_bytes: 1 << 30,
                        limit_bytes: 0,
                    },
                    max_mount_replica_count: 1,
                    volume_capabilities: vec![],
                    parameters: BTreeMap::new(),
                    secrets: BTreeMap::new(),
                    content_source: None,
                    accessibility_requirement: None,
                },
            ))
            .await
            .unwrap();
        eventually("volume created", || {
            store
                .volume("pv-0")
                .map(|v| v.state() == VolumeState::Created)
                .unwrap_or(false)
        })
        .await;

        let volume_id = store
            .volume("pv-0")
            .and_then(|v| v.detail().map(|d| d.volume_id.clone()))
            .unwrap();
        store
            .create_attachment(&Attachment::build(
                "test",
                "pv-0",
                &volume_id,
                "node-2",
                Role::Primary,
            ))
            .await
            .unwrap();

        eventually("primary attached and replica created", || {
            let primary_attached = store
                .attachment("pv-0-node-2-attachment")
                .map(|a| a.is_attached())
                .unwrap_or(false);
            let replicas = replicas(&store);
            primary_attached && replicas.len() == 1 && replicas[0].is_attached()
        })
        .await;
        let replica = replicas(&store).remove(0);
        assert_eq!(replica.spec.node_name, "node-0");

        // Losing the replica brings a new one
        store.delete_attachment(&replica.name_any()).await.unwrap();
        eventually("replica replaced", || {
            let replicas = replicas(&store);
            replicas.len() == 1
                && replicas[0].is_attached()
                && replicas[0].resource_version() != replica.resource_version()
        })
        .await;
        eventually("replacement task finished", || {
            !operator.replicas().replacement_running(&replica.name_any())
        })
        .await;

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_standalone_volume_deletion() {
        let (store, operator, shutdown) = start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        store
            .create_volume(&Volume::build(
                "pv-1",
                "test",
                VolumeSpec {
                    volume_name: "pv-1".into(),
                    capacity_range: CapacityRange::default(),
                    max_mount_replica_count: 0,
                    volume_capabilities: vec![],
                    parameters: BTreeMap::new(),
                    secrets: BTreeMap::new(),
                    content_source: None,
                    accessibility_requirement: None,
                },
            ))
            .await
            .unwrap();
        eventually("volume created", || {
            store.volume("pv-1").map(|v| v.is_created()).unwrap_or(false)
        })
        .await;

        store.delete_volume("pv-1").await.unwrap();
        eventually("volume removed", || store.volume("pv-1").is_none()).await;
        assert_eq!(operator.gc().pending_count(), 0);

        shutdown.cancel();
    }
}
